use futures::{Future, FutureExt, Stream};
use hashbrown::HashMap;
use std::{
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};

/// A set of keyed futures polled as one stream, with O(1) membership
/// checks so the runner can tell whether a pool's pass is in flight.
///
/// `F` must be [`Unpin`] since the backing map is free to move entries.
/// Polling order is arbitrary; fairness is not attempted.
#[derive(Debug)]
pub struct FutureHashMap<K, F> {
    futures: HashMap<K, F>,
}

impl<K, F> Default for FutureHashMap<K, F> {
    fn default() -> Self {
        Self {
            futures: HashMap::new(),
        }
    }
}

impl<K, F> FutureHashMap<K, F>
where
    K: Hash + Eq,
{
    /// Inserts `future` under `key`, returning the displaced future if
    /// the key was occupied.
    pub fn insert(&mut self, key: K, future: F) -> Option<F> {
        self.futures.insert(key, future)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.futures.contains_key(key)
    }
}

impl<K, F> Stream for FutureHashMap<K, F>
where
    K: Hash + Clone + Eq,
    F: Future + Unpin,
    Self: Unpin,
{
    type Item = F::Output;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let key_and_output =
            self.as_mut()
                .futures
                .iter_mut()
                .find_map(|(key, future)| match future.poll_unpin(cx) {
                    Poll::Ready(output) => Some((key.clone(), output)),
                    Poll::Pending => None,
                });
        match key_and_output {
            Some((key, output)) => {
                self.as_mut().futures.remove(&key);
                Poll::Ready(Some(output))
            }
            None if self.futures.is_empty() => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FutureHashMap;
    use futures::{channel::mpsc, future, poll, StreamExt};
    use std::task::Poll;

    #[tokio::test]
    async fn forwards_all_values_then_shuts_down() {
        let mut map = FutureHashMap::default();
        for i in 0..100u16 {
            map.insert(i, future::ready(i));
        }
        let mut values = map.collect::<Vec<u16>>().await;
        values.sort_unstable();
        assert_eq!(values, (0..100).collect::<Vec<u16>>());
    }

    #[tokio::test]
    async fn stays_alive_until_all_sources_finish() {
        let (tx0, mut rx0) = mpsc::unbounded::<()>();
        let (tx1, mut rx1) = mpsc::unbounded::<()>();
        let mut map = FutureHashMap::default();
        map.insert(0, rx0.next());
        map.insert(1, rx1.next());
        assert_eq!(poll!(map.next()), Poll::Pending);
        drop(tx0);
        assert_eq!(poll!(map.next()), Poll::Ready(Some(None)));
        assert_eq!(poll!(map.next()), Poll::Pending);
        drop(tx1);
        assert_eq!(poll!(map.next()), Poll::Ready(Some(None)));
        assert_eq!(poll!(map.next()), Poll::Ready(None));
    }
}
