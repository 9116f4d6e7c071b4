use std::time::{Duration, Instant};

/// Absolute point after which a blocking call gives up.
///
/// Built from the channel's configured timeout when a blocking call starts,
/// then asked for the remaining time before every wait. `None` means the
/// deadline is disabled and waits are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
  /// Anchors `timeout` at the current instant.
  ///
  /// A timeout too large to represent is treated as disabled.
  pub(crate) fn after(timeout: Option<Duration>) -> Self {
    Deadline(timeout.and_then(|timeout| Instant::now().checked_add(timeout)))
  }

  #[cfg(test)]
  pub(crate) fn never() -> Self {
    Deadline(None)
  }

  /// Time left before expiry, `None` if disabled. Saturates at zero.
  pub(crate) fn remaining(&self) -> Option<Duration> {
    self.0.map(|at| at.saturating_duration_since(Instant::now()))
  }

  pub(crate) fn expired(&self) -> bool {
    self.0.is_some_and(|at| Instant::now() >= at)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disabled_never_expires() {
    let deadline = Deadline::after(None);
    assert_eq!(deadline, Deadline::never());
    assert_eq!(deadline.remaining(), None);
    assert!(!deadline.expired());
  }

  #[test]
  fn zero_is_already_expired() {
    let deadline = Deadline::after(Some(Duration::ZERO));
    assert!(deadline.expired());
    assert_eq!(deadline.remaining(), Some(Duration::ZERO));
  }

  #[test]
  fn remaining_counts_down() {
    let deadline = Deadline::after(Some(Duration::from_secs(60)));
    let first = deadline.remaining().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let second = deadline.remaining().unwrap();
    assert!(second < first);
    assert!(!deadline.expired());
  }

  #[test]
  fn huge_timeout_is_disabled() {
    assert_eq!(Deadline::after(Some(Duration::MAX)), Deadline::never());
  }
}
