use amq_protocol_types::{AMQPValue, ShortString};
use lapin::BasicProperties;
use std::borrow::Borrow;

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// How many times the broker has dead-lettered this message out of `queue_name`.
    ///
    /// RabbitMQ keeps an `x-death` header with one entry per (queue, reason) pair; for a
    /// message bouncing through the delayed-retry loop, the entry for the main queue counts
    /// the completed retry cycles.
    /// Returns `0` for messages that were never dead-lettered from `queue_name`.
    fn death_count(&self, queue_name: &str) -> i64 {
        let Some(AMQPValue::FieldArray(deaths)) = self.get_header("x-death") else {
            return 0;
        };
        deaths
            .as_slice()
            .iter()
            .filter_map(|death| match death {
                AMQPValue::FieldTable(table) => Some(table.inner()),
                _ => None,
            })
            .filter(|death| match death.get("queue") {
                Some(AMQPValue::LongString(queue)) => queue.as_bytes() == queue_name.as_bytes(),
                Some(AMQPValue::ShortString(queue)) => queue.as_str() == queue_name,
                _ => false,
            })
            .filter_map(|death| match death.get("count") {
                Some(AMQPValue::LongLongInt(n)) => Some(*n),
                Some(AMQPValue::LongInt(n)) => Some(i64::from(*n)),
                _ => None,
            })
            .sum()
    }
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}
