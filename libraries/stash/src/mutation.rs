use std::fmt::Debug;

/// Items stored in a cached collection have a stable identity.
pub trait Keyed {
    type Key: PartialEq + Clone + Debug;

    fn key(&self) -> Self::Key;
}

/// A list-level change to a cached collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T: Keyed> {
    /// Append, or overwrite in place if an item with the same key exists.
    Add(T),
    /// Insert at the front, or overwrite in place if an item with the same key exists.
    Prepend(T),
    /// Overwrite the item with the same key. Missing items are left missing.
    Update(T),
    Remove(T::Key),
    /// Swap the item at `key` for `item`, which may carry a different key.
    /// Any other item already carrying the new key is dropped so the key stays unique.
    Replace { key: T::Key, item: T },
}

impl<T: Keyed> Mutation<T> {
    pub fn apply(self, items: &mut Vec<T>) {
        match self {
            Mutation::Add(item) => match position(items, &item.key()) {
                Some(index) => items[index] = item,
                None => items.push(item),
            },
            Mutation::Prepend(item) => match position(items, &item.key()) {
                Some(index) => items[index] = item,
                None => items.insert(0, item),
            },
            Mutation::Update(item) => match position(items, &item.key()) {
                Some(index) => items[index] = item,
                None => log::debug!("Update for missing key {:?} ignored", item.key()),
            },
            Mutation::Remove(key) => items.retain(|item| item.key() != key),
            Mutation::Replace { key, item } => {
                let new_key = item.key();
                if new_key != key {
                    items.retain(|existing| existing.key() != new_key);
                }
                match position(items, &key) {
                    Some(index) => items[index] = item,
                    None => items.insert(0, item),
                }
            }
        }
    }
}

fn position<T: Keyed>(items: &[T], key: &T::Key) -> Option<usize> {
    items.iter().position(|item| &item.key() == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u32,
        label: &'static str,
    }

    impl Keyed for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    fn item(id: u32, label: &'static str) -> Item {
        Item { id, label }
    }

    #[test]
    fn test_add_and_prepend() {
        let mut items = vec![item(1, "a")];
        Mutation::Add(item(2, "b")).apply(&mut items);
        Mutation::Prepend(item(3, "c")).apply(&mut items);
        assert_eq!(items, vec![item(3, "c"), item(1, "a"), item(2, "b")]);

        Mutation::Add(item(1, "a2")).apply(&mut items);
        assert_eq!(items[1], item(1, "a2"));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_update_and_remove() {
        let mut items = vec![item(1, "a"), item(2, "b")];
        Mutation::Update(item(2, "b2")).apply(&mut items);
        Mutation::Update(item(9, "missing")).apply(&mut items);
        assert_eq!(items, vec![item(1, "a"), item(2, "b2")]);

        Mutation::Remove(1).apply(&mut items);
        assert_eq!(items, vec![item(2, "b2")]);
    }

    #[test]
    fn test_replace_keeps_position_and_uniqueness() {
        let mut items = vec![item(1, "a"), item(100, "draft"), item(2, "b")];
        Mutation::Replace {
            key: 100,
            item: item(42, "saved"),
        }
        .apply(&mut items);
        assert_eq!(items, vec![item(1, "a"), item(42, "saved"), item(2, "b")]);

        // a refetch may already have brought the saved item in
        let mut items = vec![item(42, "fetched"), item(100, "draft")];
        Mutation::Replace {
            key: 100,
            item: item(42, "saved"),
        }
        .apply(&mut items);
        assert_eq!(items, vec![item(42, "saved")]);
    }
}
