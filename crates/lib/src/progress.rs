//! Progress reporting seam.
//!
//! Executors announce each action before running it. Labels look like
//! `+ network default/demo-network`.

/// Receives a notification as each action starts.
pub trait ProgressObserver: Send + Sync {
  fn on_action_start(&self, label: &str);
}

impl<F> ProgressObserver for F
where
  F: Fn(&str) + Send + Sync,
{
  fn on_action_start(&self, label: &str) {
    self(label)
  }
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
  fn on_action_start(&self, _label: &str) {}
}
