// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumed Queue Definition
//!
//! Describes the queue a dispatcher consumes from and where its dead letters go.
//! Declaring the queue itself is left to whoever owns the broker topology.

/// Queue a consumer reads from, built with chained setters.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) dlq_name: Option<String>,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) exclusive: bool,
}

impl QueueDefinition {
    /// Creates a definition for the queue `name`, without dead-letter queue.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            dlq_name: None,
            consumer_tag: None,
            exclusive: false,
        }
    }

    /// Sends rejected messages to `<name>-dlq`.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Sends rejected messages to the queue `dlq`.
    pub fn dlq(mut self, dlq: &str) -> Self {
        self.dlq_name = Some(dlq.to_owned());
        self
    }

    /// Fixes the consumer tag; a unique one is generated otherwise.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// Asks the broker for exclusive consumer access to the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_dlq_derives_name_from_queue() {
        let def = QueueDefinition::new("manual_ack_queue").with_dlq();

        assert_eq!(def.name(), "manual_ack_queue");
        assert_eq!(def.dlq_name(), Some("manual_ack_queue-dlq"));
    }

    #[test]
    fn explicit_dlq_overrides_default() {
        let def = QueueDefinition::new("orders").with_dlq().dlq("graveyard");

        assert_eq!(def.dlq_name(), Some("graveyard"));
        assert!(QueueDefinition::new("orders").dlq_name().is_none());
    }
}
