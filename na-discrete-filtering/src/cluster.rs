//! A local worker pool standing in for a compute cluster. Tasks are
//! submitted without blocking; their results are collected through
//! futures.

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use rayon::{ThreadPool, ThreadPoolBuilder, Yield};
use serde::Deserialize;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use na_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LocalCluster {
  /// `0` uses one worker per logical CPU.
  pub n_workers: usize,
  pub thread_name: String,
}
impl Default for LocalCluster {
  fn default() -> LocalCluster {
    LocalCluster {
      n_workers: 0,
      thread_name: "assim-worker".into(),
    }
  }
}
impl LocalCluster {
  pub fn with_workers(n_workers: usize) -> LocalCluster {
    LocalCluster {
      n_workers,
      ..Default::default()
    }
  }
}

/// How a distributed filter splits its work and where it runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
  /// Work items (grid points or columns) per task.
  pub chunk_size: usize,
  pub cluster: LocalCluster,
}
impl Default for DistributedConfig {
  fn default() -> DistributedConfig {
    DistributedConfig {
      chunk_size: 10,
      cluster: LocalCluster::default(),
    }
  }
}

/// Handle to a running worker pool. Clones share the pool.
#[derive(Clone)]
pub struct Client {
  pool: Arc<ThreadPool>,
}

impl fmt::Debug for Client {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Client")
      .field("n_workers", &self.n_workers())
      .finish()
  }
}

impl Client {
  pub fn new(cluster: &LocalCluster) -> Result<Client> {
    let prefix = cluster.thread_name.clone();
    let pool = ThreadPoolBuilder::new()
      .num_threads(cluster.n_workers)
      .thread_name(move |i| format!("{}-{}", prefix, i))
      .build()
      .map_err(|e| Error::Configuration(format!("cannot start the worker pool: {}", e)))?;
    debug!("started worker pool with {} threads", pool.current_num_threads());

    Ok(Client {
      pool: Arc::new(pool),
    })
  }

  /// A given client is used as is; otherwise one is started on `cluster`.
  pub fn connect(client: Option<Client>, cluster: Option<&LocalCluster>) -> Result<Client> {
    match (client, cluster) {
      (Some(client), _) => Ok(client),
      (None, Some(cluster)) => Client::new(cluster),
      (None, None) => Err(Error::configuration("either a client or a cluster is required")),
    }
  }

  pub fn n_workers(&self) -> usize { self.pool.current_num_threads() }

  /// Queues `task` on the pool and returns immediately. A panic inside the
  /// task is reported as `Error::Task` by the future. Tasks may submit to
  /// and wait on the pool they run in.
  pub fn submit<T, F>(&self, task: F) -> Future<T>
    where F: FnOnce() -> Result<T> + Send + 'static,
          T: Send + 'static,
  {
    let (tx, rx) = bounded(1);
    self.pool.spawn(move || {
      let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(Error::Task(panic_message(payload.as_ref()))),
      };
      // nobody is waiting if the future was dropped
      let _ = tx.send(outcome);
    });

    Future {
      rx,
      pool: self.pool.clone(),
    }
  }

  /// Blocks until every future resolved; outcomes keep the input order.
  pub fn gather<T>(&self, futures: Vec<Future<T>>) -> Vec<Result<T>> {
    futures.into_iter()
      .map(Future::result)
      .collect()
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "task panicked".to_string()
  }
}

/// The pending result of a submitted task.
pub struct Future<T> {
  rx: Receiver<Result<T>>,
  pool: Arc<ThreadPool>,
}

impl<T> fmt::Debug for Future<T> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Future")
      .field("ready", &self.is_ready())
      .finish()
  }
}

impl<T> Future<T> {
  pub fn is_ready(&self) -> bool { !self.rx.is_empty() }

  /// Blocks until the task finished. On a worker of the task's own pool
  /// the wait runs other queued tasks instead of blocking, so a task
  /// waiting on work it submitted cannot starve a small pool.
  pub fn result(self) -> Result<T> {
    if self.pool.current_thread_index().is_none() {
      return self.rx.recv().unwrap_or_else(|_| Err(dropped()));
    }
    loop {
      match self.rx.try_recv() {
        Ok(outcome) => return outcome,
        Err(TryRecvError::Disconnected) => return Err(dropped()),
        Err(TryRecvError::Empty) => {
          // the task runs on another worker
          if let Some(Yield::Idle) = self.pool.yield_now() {
            thread::yield_now();
          }
        },
      }
    }
  }
}

fn dropped() -> Error {
  Error::Task("the worker dropped the task".into())
}

/// Waits for the tasks of one chunked computation, in chunk order. A
/// failed chunk is reported as `Error::Chunk` carrying its index; the
/// other outcomes are unaffected.
pub fn gather_chunks<T>(futures: Vec<Future<T>>) -> Vec<Result<T>> {
  futures.into_iter()
    .enumerate()
    .map(|(index, future)| {
      debug!("gathering chunk {}", index);
      future.result().map_err(|e| {
        error!("chunk {} failed: {}", index, e);
        Error::Chunk {
          index,
          source: Box::new(e),
        }
      })
    })
    .collect()
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn submit_and_gather_in_order() {
    let client = Client::new(&LocalCluster::with_workers(2)).unwrap();
    assert_eq!(client.n_workers(), 2);

    let futures = (0..8usize)
      .map(|i| client.submit(move || Ok(i * i)))
      .collect::<Vec<_>>();
    let results = client.gather(futures)
      .into_iter()
      .collect::<Result<Vec<_>>>()
      .unwrap();
    assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
  }

  #[test]
  fn failures_stay_with_their_task() {
    let client = Client::new(&LocalCluster::with_workers(2)).unwrap();
    let ok = client.submit(|| Ok(1));
    let failed = client.submit(|| -> Result<i32> { Err(Error::validation("bad input")) });
    let panicked = client.submit(|| -> Result<i32> { panic!("worker exploded") });

    let results = client.gather(vec![ok, failed, panicked]);
    assert_eq!(*results[0].as_ref().unwrap(), 1);
    assert!(matches!(results[1], Err(Error::Validation(_))));
    match &results[2] {
      Err(Error::Task(msg)) => assert!(msg.contains("worker exploded")),
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[test]
  fn tasks_can_wait_on_their_own_pool() {
    let client = Client::new(&LocalCluster::with_workers(1)).unwrap();
    let inner = client.clone();
    let outer = client.submit(move || {
      let nested = inner.submit(|| Ok(7));
      nested.result().map(|v| v * 3)
    });
    assert_eq!(outer.result().unwrap(), 21);
  }

  #[test]
  fn futures_become_ready() {
    let client = Client::new(&LocalCluster::with_workers(1)).unwrap();
    let (tx, rx) = bounded::<()>(0);
    let future = client.submit(move || {
      rx.recv().map_err(|e| Error::Task(e.to_string()))?;
      Ok(5)
    });
    assert!(!future.is_ready());
    tx.send(()).unwrap();
    while !future.is_ready() {
      thread::yield_now();
    }
    assert_eq!(future.result().unwrap(), 5);
  }

  #[test]
  fn chunk_failures_carry_their_index() {
    let client = Client::new(&LocalCluster::with_workers(2)).unwrap();
    let futures = (0..4usize)
      .map(|i| {
        client.submit(move || {
          if i == 2 {
            Err(Error::Numerical("singular".into()))
          } else {
            Ok(i)
          }
        })
      })
      .collect::<Vec<_>>();
    let outcomes = gather_chunks(futures);
    assert_eq!(*outcomes[3].as_ref().unwrap(), 3);
    match &outcomes[2] {
      Err(Error::Chunk { index, source }) => {
        assert_eq!(*index, 2);
        assert!(matches!(**source, Error::Numerical(_)));
      },
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[test]
  fn connect_rules() {
    let cluster = LocalCluster::with_workers(3);
    assert_eq!(Client::connect(None, Some(&cluster)).unwrap().n_workers(), 3);
    let given = Client::new(&LocalCluster::with_workers(1)).unwrap();
    assert_eq!(Client::connect(Some(given), Some(&cluster)).unwrap().n_workers(), 1);
    assert!(matches!(Client::connect(None, None), Err(Error::Configuration(_))));
  }

  #[test]
  fn cluster_from_toml() {
    let cluster: LocalCluster = toml::from_str("n_workers = 3").unwrap();
    assert_eq!(cluster.n_workers, 3);
    assert_eq!(cluster.thread_name, LocalCluster::default().thread_name);
  }
}
