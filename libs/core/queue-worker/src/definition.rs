//! Worker definitions
//!
//! A `WorkerDefinition` names a worker kind, the destination it consumes and
//! where its faulted messages go. Per-instance `WorkerOptions` may override
//! the dead-letter policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_worker::{DeadLetterPolicy, WorkerDefinition};
//!
//! let calc = WorkerDefinition::new("Calc");
//! let billing = WorkerDefinition::new("Billing")
//!     .with_virtual_topic("orders")
//!     .with_dead_letter(DeadLetterPolicy::named("BillingErrors"));
//! ```

use crate::config::WorkerOptions;
use crate::destination::Destination;
use crate::error::WorkerError;

/// Suffix of the default dead-letter queue name
const DEAD_LETTER_SUFFIX: &str = "Failure";

/// Where faulted messages are forwarded
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeadLetterPolicy {
    /// Faulted messages are dropped after the fault is recorded
    Off,
    /// Forward to `<WorkerName>Failure`
    #[default]
    On,
    /// Forward to the named queue
    Named(String),
}

impl DeadLetterPolicy {
    pub fn named(queue: impl Into<String>) -> Self {
        DeadLetterPolicy::Named(queue.into())
    }

    /// Concrete dead-letter queue for `worker_name`, `None` when disabled
    pub fn destination(&self, worker_name: &str) -> Option<Destination> {
        match self {
            DeadLetterPolicy::Off => None,
            DeadLetterPolicy::On => Some(Destination::queue(format!(
                "{}{}",
                worker_name, DEAD_LETTER_SUFFIX
            ))),
            DeadLetterPolicy::Named(queue) => Some(Destination::queue(queue.clone())),
        }
    }
}

/// Static description of a worker kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDefinition {
    pub name: String,
    pub destination: Destination,
    pub dead_letter: DeadLetterPolicy,
}

impl WorkerDefinition {
    /// Worker consuming the queue of the same name, dead-lettering enabled
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            destination: Destination::queue(name.clone()),
            name,
            dead_letter: DeadLetterPolicy::default(),
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_queue(self, queue: impl Into<String>) -> Self {
        self.with_destination(Destination::queue(queue))
    }

    pub fn with_topic(self, topic: impl Into<String>) -> Self {
        self.with_destination(Destination::topic(topic))
    }

    pub fn with_virtual_topic(self, topic: impl Into<String>) -> Self {
        self.with_destination(Destination::virtual_topic(topic))
    }

    pub fn with_dead_letter(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter = policy;
        self
    }

    /// Check the definition on its own
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.name.trim().is_empty() {
            return Err(WorkerError::config("worker name must not be empty"));
        }
        if self.destination.name().trim().is_empty() {
            return Err(WorkerError::config(format!(
                "worker {} has an empty destination",
                self.name
            )));
        }
        self.resolve_dead_letter(&WorkerOptions::default()).map(|_| ())
    }

    /// Effective dead-letter queue; the options' policy wins over the definition's
    pub fn resolve_dead_letter(
        &self,
        options: &WorkerOptions,
    ) -> Result<Option<Destination>, WorkerError> {
        let policy = options.dead_letter.as_ref().unwrap_or(&self.dead_letter);

        if let DeadLetterPolicy::Named(queue) = policy
            && queue.trim().is_empty()
        {
            return Err(WorkerError::config(format!(
                "worker {} has an empty dead-letter queue name",
                self.name
            )));
        }

        let target = policy.destination(&self.name);
        if let Some(target) = &target
            && *target == self.destination
        {
            return Err(WorkerError::config(format!(
                "worker {} would dead-letter into its own destination {}",
                self.name, target
            )));
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let definition = WorkerDefinition::new("Calc");
        assert_eq!(definition.destination, Destination::queue("Calc"));
        assert_eq!(definition.dead_letter, DeadLetterPolicy::On);
        assert_eq!(
            definition.resolve_dead_letter(&WorkerOptions::default()).unwrap(),
            Some(Destination::queue("CalcFailure"))
        );
    }

    #[test]
    fn test_options_override_definition() {
        let definition = WorkerDefinition::new("Calc").with_dead_letter(DeadLetterPolicy::Off);
        assert_eq!(
            definition.resolve_dead_letter(&WorkerOptions::default()).unwrap(),
            None
        );

        let options = WorkerOptions::new().with_dead_letter(DeadLetterPolicy::named("Errors"));
        assert_eq!(
            definition.resolve_dead_letter(&options).unwrap(),
            Some(Destination::queue("Errors"))
        );

        let options = WorkerOptions::new().with_dead_letter(DeadLetterPolicy::Off);
        let definition = WorkerDefinition::new("Calc");
        assert_eq!(definition.resolve_dead_letter(&options).unwrap(), None);
    }

    #[test]
    fn test_rejects_dead_letter_into_own_queue() {
        let definition = WorkerDefinition::new("Calc")
            .with_dead_letter(DeadLetterPolicy::named("Calc"));
        assert!(matches!(definition.validate(), Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_names() {
        assert!(WorkerDefinition::new("").validate().is_err());
        assert!(WorkerDefinition::new("Calc").with_queue(" ").validate().is_err());
        assert!(
            WorkerDefinition::new("Calc")
                .with_dead_letter(DeadLetterPolicy::named(""))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_virtual_topic_definition() {
        let definition = WorkerDefinition::new("Billing").with_virtual_topic("orders");
        assert_eq!(definition.destination, Destination::virtual_topic("orders"));
        assert!(definition.validate().is_ok());
    }
}
