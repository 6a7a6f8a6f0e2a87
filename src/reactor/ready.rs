//! Dense append-only view of the notifier's ready set.
//!
//! Iteration is an indexed walk over an array, removal is a branch-free
//! slot nulling, and a mid-iteration re-poll truncates with `reset` in
//! O(1), none of which the notifier's own event list offers once
//! dispatch starts mutating the registration table underneath it.

use mio::Token;

use crate::ops::Ops;

#[derive(Clone, Copy)]
pub(crate) struct ReadyKey {
    pub token: Token,
    pub ready: Ops,
}

pub(crate) struct ReadyKeys {
    keys: Vec<Option<ReadyKey>>,
    len: usize,
}

impl ReadyKeys {
    pub fn with_capacity(cap: usize) -> Self {
        ReadyKeys {
            keys: Vec::with_capacity(cap),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push(&mut self, key: ReadyKey) {
        if self.len == self.keys.len() {
            self.keys.push(Some(key));
        } else {
            self.keys[self.len] = Some(key);
        }
        self.len += 1;
    }

    /// Takes the slot at `i`, nulling it so the attachment behind it can
    /// be reclaimed as soon as its channel closes. Out-of-range reads
    /// return `None`.
    pub fn take(&mut self, i: usize) -> Option<ReadyKey> {
        if i >= self.len {
            return None;
        }
        self.keys[i].take()
    }

    /// Nulls every slot from `from` on and empties the view.
    pub fn reset(&mut self, from: usize) {
        for slot in self.keys.iter_mut().skip(from) {
            *slot = None;
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: usize) -> ReadyKey {
        ReadyKey {
            token: Token(n),
            ready: Ops::READ,
        }
    }

    #[test]
    fn take_nulls_the_slot() {
        let mut keys = ReadyKeys::with_capacity(4);
        keys.push(key(0));
        keys.push(key(1));
        assert_eq!(keys.take(0).map(|k| k.token), Some(Token(0)));
        assert!(keys.take(0).is_none());
        assert_eq!(keys.take(1).map(|k| k.token), Some(Token(1)));
        assert!(keys.take(2).is_none());
    }

    #[test]
    fn reset_truncates_and_allows_refill() {
        let mut keys = ReadyKeys::with_capacity(2);
        for i in 0..5 {
            keys.push(key(i));
        }
        keys.reset(2);
        assert_eq!(keys.len(), 0);
        keys.push(key(9));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.take(0).map(|k| k.token), Some(Token(9)));
    }
}
