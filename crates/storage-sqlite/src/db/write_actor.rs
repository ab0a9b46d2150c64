//! Single writer that serialises every write in an immediate transaction.

use diesel::sqlite::SqliteConnection;
use log::error;
use tokio::sync::{mpsc, oneshot};

use attendsync_core::errors::{DatabaseError, Error, Result};

use super::{get_connection, DbPool};
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

const WRITE_QUEUE_CAPACITY: usize = 256;

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<Job>,
}

impl WriteHandle {
    /// Runs `job` on the writer connection inside an immediate transaction.
    /// An `Err` from the job rolls back everything it wrote.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let boxed: Job = Box::new(move |conn| {
            let result = conn
                .immediate_transaction::<_, StorageError, _>(|tx| job(tx).map_err(StorageError::from))
                .map_err(Error::from);
            let _ = reply_tx.send(result);
        });

        self.tx.send(boxed).await.map_err(|_| {
            Error::Database(DatabaseError::Internal("writer task has stopped".to_string()))
        })?;
        reply_rx.await.map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "writer dropped the job without replying".to_string(),
            ))
        })?
    }
}

/// Starts the writer on a blocking thread. Jobs run in arrival order.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::channel::<Job>(WRITE_QUEUE_CAPACITY);
    tokio::task::spawn_blocking(move || {
        while let Some(job) = rx.blocking_recv() {
            match get_connection(&pool) {
                Ok(mut conn) => job(&mut *conn),
                Err(err) => {
                    // Dropping the job closes its reply channel.
                    error!("[Storage] writer could not get a connection: {}", err);
                    drop(job);
                }
            }
        }
    });
    WriteHandle { tx }
}
