//! The most basic building block of the recovery model: keyed
//! changes.
//!
//! Both the state store and the progress store are K-V mappings that
//! are written to and read back as ordered streams of [`KChange`]s.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::Hash;

use serde::Deserialize;
use serde::Serialize;

/// A change to a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change<V> {
    /// The value was created or overwritten.
    Upsert(V),
    /// The value was deleted.
    Discard,
}

/// A change to a key in a K-V mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KChange<K, V>(pub K, pub Change<V>);

/// Something you can write a stream of keyed changes into.
pub trait KWriter<K, V> {
    fn write(&mut self, kchange: KChange<K, V>);

    fn write_many(&mut self, kchanges: Vec<KChange<K, V>>) {
        for kchange in kchanges {
            self.write(kchange);
        }
    }
}

/// Something you can read an ordered stream of keyed changes back out
/// of. [`None`] means the stream is complete.
pub trait KReader<K, V> {
    fn read(&mut self) -> Option<KChange<K, V>>;
}

impl<K, V> KWriter<K, V> for HashMap<K, V>
where
    K: Hash + Eq,
{
    fn write(&mut self, kchange: KChange<K, V>) {
        let KChange(key, change) = kchange;
        match change {
            Change::Upsert(value) => {
                self.insert(key, value);
            }
            Change::Discard => {
                self.remove(&key);
            }
        }
    }
}

impl<K, V> KWriter<K, V> for BTreeMap<K, V>
where
    K: Ord,
{
    fn write(&mut self, kchange: KChange<K, V>) {
        let KChange(key, change) = kchange;
        match change {
            Change::Upsert(value) => {
                self.insert(key, value);
            }
            Change::Discard => {
                self.remove(&key);
            }
        }
    }
}

impl<K, V, W> KWriter<K, V> for Box<W>
where
    W: KWriter<K, V> + ?Sized,
{
    fn write(&mut self, kchange: KChange<K, V>) {
        (**self).write(kchange)
    }
}

impl<K, V, R> KReader<K, V> for Box<R>
where
    R: KReader<K, V> + ?Sized,
{
    fn read(&mut self) -> Option<KChange<K, V>> {
        (**self).read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_upsert_then_discard() {
        let mut map = HashMap::new();

        map.write(KChange("a", Change::Upsert(1)));
        assert_eq!(map.get("a"), Some(&1));

        map.write(KChange("a", Change::Upsert(2)));
        assert_eq!(map.get("a"), Some(&2));

        map.write(KChange("a", Change::Discard));
        assert!(map.is_empty());
    }
}
