mod converter;
mod reconciler;

pub use converter::FeedbackLoop;
pub use reconciler::{ReconcileReport, Reconciler};
