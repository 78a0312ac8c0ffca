//! Change publication
//!
//! Hands finished change events to replication listeners. Delivery is
//! synchronous and reaches every listener even when earlier ones fail;
//! failures are folded into a single `ReplicationFailed` error.
//!
//! Author: Moroya Sakamoto

use tracing::{info, warn};

use crate::change::ChangeEvent;
use crate::error::{ListenerError, ReleaseError, Result};

/// Consumer of release changes, typically a replication target.
pub trait ChangeListener {
    /// Short name used in logs and error messages
    fn name(&self) -> &str {
        "listener"
    }

    fn receive(&mut self, event: &ChangeEvent) -> std::result::Result<(), ListenerError>;
}

/// Delivers change events to registered listeners in registration order.
#[derive(Default)]
pub struct ChangePublisher {
    listeners: Vec<Box<dyn ChangeListener>>,
}

impl ChangePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Box<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `event` to every listener.
    ///
    /// Empty events are not delivered unless they force a full check.
    /// Returns the number of listeners reached.
    pub fn publish(&mut self, event: &ChangeEvent) -> Result<usize> {
        if event.is_empty() && !event.force_full_check() {
            return Ok(0);
        }
        let mut failures: Vec<(String, ListenerError)> = Vec::new();
        let mut delivered = 0;
        for listener in &mut self.listeners {
            match listener.receive(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        listener = listener.name(),
                        release = event.release_number(),
                        error = %e,
                        "replication listener failed"
                    );
                    failures.push((listener.name().to_string(), e));
                }
            }
        }

        let mut failures = failures.into_iter();
        let Some((first, source)) = failures.next() else {
            info!(release = event.release_number(), delivered, "published release changes");
            return Ok(delivered);
        };
        let suppressed: Vec<ListenerError> = failures.map(|(_, e)| e).collect();
        Err(ReleaseError::ReplicationFailed {
            message: format!(
                "replication of release {} failed in {first} and {} more",
                event.release_number(),
                suppressed.len()
            ),
            source,
            suppressed,
            event: Box::new(event.clone()),
        })
    }
}

impl std::fmt::Debug for ChangePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.listeners.iter().map(|l| l.name()).collect();
        f.debug_struct("ChangePublisher")
            .field("listeners", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::Release;
    use std::cell::RefCell;
    use std::rc::Rc;
    use uuid::Uuid;

    struct Recorder {
        name: &'static str,
        seen: Rc<RefCell<Vec<String>>>,
        fail: bool,
    }

    impl ChangeListener for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn receive(&mut self, event: &ChangeEvent) -> std::result::Result<(), ListenerError> {
            self.seen.borrow_mut().push(self.name.to_string());
            if self.fail {
                return Err(format!("{} is down", self.name).into());
            }
            assert!(event.is_finalized());
            Ok(())
        }
    }

    fn release() -> Release {
        Release {
            id: Uuid::new_v4(),
            number: String::from("r1"),
            root: String::from("/site"),
            node_path: String::from("/site/meta/releases/r1"),
            marks: Vec::new(),
            closed: false,
            previous_release: None,
            change_number: None,
            created: None,
            last_modified: None,
        }
    }

    fn event() -> ChangeEvent {
        let mut ev = ChangeEvent::new(&release());
        ev.add_move_or_update(None, Some("a")).unwrap();
        ev.finish();
        ev
    }

    fn publisher(fails: &[bool], seen: &Rc<RefCell<Vec<String>>>) -> ChangePublisher {
        let names = ["one", "two", "three"];
        let mut publisher = ChangePublisher::new();
        for (name, &fail) in names.iter().zip(fails) {
            publisher.register(Box::new(Recorder {
                name: *name,
                seen: Rc::clone(seen),
                fail,
            }));
        }
        publisher
    }

    #[test]
    fn test_publish_reaches_all() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut publisher = publisher(&[false, false], &seen);
        assert_eq!(publisher.publish(&event()).unwrap(), 2);
        assert_eq!(*seen.borrow(), vec!["one", "two"]);
    }

    #[test]
    fn test_failures_are_aggregated() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut publisher = publisher(&[true, false, true], &seen);
        let err = publisher.publish(&event()).unwrap_err();
        assert_eq!(seen.borrow().len(), 3);
        match err {
            ReleaseError::ReplicationFailed {
                source,
                suppressed,
                event,
                ..
            } => {
                assert_eq!(source.to_string(), "one is down");
                assert_eq!(suppressed.len(), 1);
                assert_eq!(suppressed[0].to_string(), "three is down");
                assert_eq!(event.new_paths().len(), 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_event_not_delivered() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut publisher = publisher(&[false], &seen);
        let mut empty = ChangeEvent::new(&release());
        empty.finish();
        assert_eq!(publisher.publish(&empty).unwrap(), 0);
        assert!(seen.borrow().is_empty());

        let mut forced = ChangeEvent::new(&release());
        forced.set_force_full_check().unwrap();
        forced.finish();
        assert_eq!(publisher.publish(&forced).unwrap(), 1);
    }
}
