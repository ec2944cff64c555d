//! Reorder buffer for one-shot replies.
//!
//! Each accepted turn takes a ticket; replies are released strictly in
//! ticket order, however they arrive.

use std::collections::BTreeMap;

#[derive(Debug)]
pub struct ReplyOrder<T> {
    next_ticket: u64,
    next_release: u64,
    ready: BTreeMap<u64, T>,
}

impl<T> Default for ReplyOrder<T> {
    fn default() -> Self {
        Self {
            next_ticket: 0,
            next_release: 0,
            ready: BTreeMap::new(),
        }
    }
}

impl<T> ReplyOrder<T> {
    pub fn ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Record the outcome for `ticket` and return every outcome that is now
    /// releasable, in order.
    pub fn complete(&mut self, ticket: u64, value: T) -> Vec<T> {
        if ticket < self.next_release {
            return Vec::new();
        }
        self.ready.insert(ticket, value);

        let mut released = Vec::new();
        while let Some(value) = self.ready.remove(&self.next_release) {
            released.push(value);
            self.next_release += 1;
        }
        released
    }

    /// Tickets issued but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.next_ticket - self.next_release
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_release() {
        let mut order = ReplyOrder::default();
        let a = order.ticket();
        let b = order.ticket();
        assert_eq!(order.complete(a, "a"), vec!["a"]);
        assert_eq!(order.complete(b, "b"), vec!["b"]);
        assert_eq!(order.outstanding(), 0);
    }

    #[test]
    fn test_out_of_order_is_held() {
        let mut order = ReplyOrder::default();
        let a = order.ticket();
        let b = order.ticket();
        let c = order.ticket();

        assert!(order.complete(c, "c").is_empty());
        assert!(order.complete(b, "b").is_empty());
        assert_eq!(order.outstanding(), 3);
        assert_eq!(order.complete(a, "a"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut order: ReplyOrder<()> = ReplyOrder::default();
        let a = order.ticket();
        let _b = order.ticket();
        order.reset();
        assert_eq!(order.outstanding(), 0);
        assert_eq!(order.ticket(), a);
    }

    #[test]
    fn test_duplicate_release_ignored() {
        let mut order = ReplyOrder::default();
        let a = order.ticket();
        assert_eq!(order.complete(a, 1), vec![1]);
        assert!(order.complete(a, 2).is_empty());
    }
}
