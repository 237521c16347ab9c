//! Naming strategy for exchanges, queues, consumer tags and dead-letter
//! topology. Swappable so applications can match an existing broker layout.

use uuid::Uuid;

pub trait Conventions: Send + Sync {
    fn exchange_name(&self, message_type: &str) -> String;
    fn queue_name(&self, message_type: &str, subscription_id: &str) -> String;
    fn consumer_tag(&self) -> String;
    fn dead_letter_exchange_name(&self, exchange: &str) -> String;
    fn dead_letter_queue_name(&self, queue: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConventions;

impl Conventions for DefaultConventions {
    fn exchange_name(&self, message_type: &str) -> String {
        message_type.to_string()
    }

    fn queue_name(&self, message_type: &str, subscription_id: &str) -> String {
        format!("{message_type}.{subscription_id}")
    }

    fn consumer_tag(&self) -> String {
        format!("consumer-{}", Uuid::new_v4())
    }

    fn dead_letter_exchange_name(&self, exchange: &str) -> String {
        format!("{exchange}.dlx")
    }

    fn dead_letter_queue_name(&self, queue: &str) -> String {
        format!("{queue}.dlq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_are_deterministic() {
        let conventions = DefaultConventions;
        assert_eq!(conventions.exchange_name("order"), "order");
        assert_eq!(conventions.queue_name("order", "billing"), "order.billing");
        assert_eq!(conventions.dead_letter_exchange_name("order"), "order.dlx");
        assert_eq!(
            conventions.dead_letter_queue_name("order.billing"),
            "order.billing.dlq"
        );
    }

    #[test]
    fn consumer_tags_are_unique() {
        let conventions = DefaultConventions;
        assert_ne!(conventions.consumer_tag(), conventions.consumer_tag());
    }
}
