//! Terminal flow operators: reducers and single-value extractors.
//!
//! `first` and friends stop the upstream through the private abort marker;
//! the marker never escapes these functions.

use std::sync::{Arc, Mutex};

use weft_core::error::Failure;

use crate::flow::{is_own_abort, next_abort_owner, Flow};

impl<T: Send + 'static> Flow<T> {
    /// Collect every value into a vector.
    pub async fn to_list(&self) -> Result<Vec<T>, Failure> {
        let values: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&values);
        self.for_each(move |v| {
            sink.lock().unwrap().push(v);
            Ok(())
        })
        .await?;
        let mut guard = values.lock().unwrap();
        Ok(std::mem::take(&mut *guard))
    }

    /// Count the values.
    pub async fn count(&self) -> Result<usize, Failure> {
        let counter = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&counter);
        self.for_each(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        })
        .await?;
        let count = *counter.lock().unwrap();
        Ok(count)
    }

    /// Left fold over the values.
    pub async fn fold<A: Send + 'static>(
        &self,
        init: A,
        op: impl Fn(A, T) -> A + Send + Sync + 'static,
    ) -> Result<A, Failure> {
        let accumulator = Arc::new(Mutex::new(Some(init)));
        let sink = Arc::clone(&accumulator);
        self.for_each(move |v| {
            let mut slot = sink.lock().unwrap();
            let acc = slot.take().expect("fold accumulator is always present");
            *slot = Some(op(acc, v));
            Ok(())
        })
        .await?;
        let mut guard = accumulator.lock().unwrap();
        Ok(guard.take().expect("fold accumulator survives collection"))
    }

    /// Reduce with the first value as the seed. Fails on an empty flow.
    pub async fn reduce(
        &self,
        op: impl Fn(T, T) -> T + Send + Sync + 'static,
    ) -> Result<T, Failure> {
        let result = self
            .fold(None, move |acc: Option<T>, v| match acc {
                None => Some(v),
                Some(acc) => Some(op(acc, v)),
            })
            .await?;
        result.ok_or_else(|| Failure::app("cannot reduce an empty flow"))
    }

    /// The last value. Fails on an empty flow.
    pub async fn last(&self) -> Result<T, Failure> {
        let result = self.fold(None, |_, v| Some(v)).await?;
        result.ok_or_else(|| Failure::app("flow completed without a value"))
    }

    /// The first value, stopping the upstream as soon as it arrives.
    /// Fails on an empty flow.
    pub async fn first(&self) -> Result<T, Failure> {
        self.first_or_null()
            .await?
            .ok_or_else(|| Failure::app("flow completed without a value"))
    }

    /// The first value, or `None` on an empty flow.
    pub async fn first_or_null(&self) -> Result<Option<T>, Failure> {
        let owner = next_abort_owner();
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        let outcome = self
            .for_each(move |v| {
                *sink.lock().unwrap() = Some(v);
                Err(Failure::flow_aborted(owner))
            })
            .await;
        match outcome {
            Ok(()) => Ok(None),
            Err(failure) if is_own_abort(&failure, owner) => {
                let mut guard = slot.lock().unwrap();
                Ok(guard.take())
            }
            Err(failure) => Err(failure),
        }
    }

    /// The only value. Fails when the flow is empty or emits more than one.
    pub async fn single(&self) -> Result<T, Failure> {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        self.for_each(move |v| {
            let mut guard = sink.lock().unwrap();
            if guard.is_some() {
                return Err(Failure::app("flow emitted more than one value"));
            }
            *guard = Some(v);
            Ok(())
        })
        .await?;
        let mut guard = slot.lock().unwrap();
        guard
            .take()
            .ok_or_else(|| Failure::app("flow completed without a value"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{flow, flow_of};
    use weft_core::scope::run_blocking;

    #[test]
    fn fold_and_reduce_agree() {
        run_blocking(async {
            let f = flow_of(1..=5);
            assert_eq!(f.fold(0, |acc, v| acc + v).await?, 15);
            assert_eq!(f.reduce(|acc, v| acc + v).await?, 15);
            assert_eq!(f.count().await?, 5);
            assert_eq!(f.last().await?, 5);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reduce_on_empty_flow_fails() {
        run_blocking(async {
            let empty: Flow<i32> = crate::flow::empty_flow();
            assert!(empty.reduce(|a, b| a + b).await.is_err());
            assert!(empty.last().await.is_err());
            assert!(empty.single().await.is_err());
            assert_eq!(empty.first_or_null().await?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn first_aborts_the_upstream() {
        run_blocking(async {
            let emitted = Arc::new(Mutex::new(0));
            let emitted_in_flow = Arc::clone(&emitted);
            let f = flow(move |sink| {
                let emitted = Arc::clone(&emitted_in_flow);
                async move {
                    for i in 10.. {
                        *emitted.lock().unwrap() += 1;
                        sink.emit(i).await?;
                    }
                    Ok(())
                }
            });
            assert_eq!(f.first().await?, 10);
            assert_eq!(*emitted.lock().unwrap(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn single_rejects_a_second_value() {
        run_blocking(async {
            assert_eq!(flow_of(vec![7]).single().await?, 7);
            let failure = flow_of(vec![1, 2]).single().await.unwrap_err();
            assert_eq!(failure.message(), "flow emitted more than one value");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn abort_marker_from_another_collector_is_rethrown() {
        run_blocking(async {
            // A foreign abort marker must not be swallowed by first().
            let foreign = Failure::flow_aborted(u64::MAX);
            let foreign_in_flow = foreign.clone();
            let f: Flow<i32> = flow(move |_sink| {
                let failure = foreign_in_flow.clone();
                async move { Err(failure) }
            });
            let seen = f.first().await.unwrap_err();
            assert!(seen.same(&foreign));
            Ok(())
        })
        .unwrap();
    }
}
