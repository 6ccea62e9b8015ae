//! Proof generation on a dedicated thread.
//!
//! Callers send a witness and await the reply; the proving thread is never
//! the caller's runtime thread. Dropping the awaiting future cancels the
//! request from the caller's side: the result is discarded when it arrives.
//! Dropping the [`ProvingWorker`] stops the thread after its current job.

use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::circuit::ProofBackend;
use crate::client::witness::Witness;
use crate::error::AttestationError;

const QUEUE_DEPTH: usize = 4;

struct ProveRequest {
    witness: Witness,
    reply: oneshot::Sender<Result<Vec<u8>, AttestationError>>,
}

pub struct ProvingWorker {
    requests: mpsc::Sender<ProveRequest>,
}

impl ProvingWorker {
    pub fn spawn(backend: Arc<dyn ProofBackend>) -> Result<Self, AttestationError> {
        let (requests, mut queue) = mpsc::channel::<ProveRequest>(QUEUE_DEPTH);
        thread::Builder::new()
            .name("proving-worker".to_string())
            .spawn(move || {
                while let Some(request) = queue.blocking_recv() {
                    if request.reply.is_closed() {
                        debug!("Dropping proof request abandoned before it started");
                        continue;
                    }
                    let result = backend.prove(&request.witness);
                    if request.reply.send(result).is_err() {
                        warn!("Proof finished after its caller stopped waiting; discarded");
                    }
                }
                debug!("Proving worker stopped");
            })
            .map_err(|e| AttestationError::Proving(format!("failed to start proving thread: {e}")))?;
        Ok(Self { requests })
    }

    pub async fn prove(&self, witness: Witness) -> Result<Vec<u8>, AttestationError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ProveRequest { witness, reply })
            .await
            .map_err(|_| AttestationError::WorkerGone)?;
        response.await.map_err(|_| AttestationError::WorkerGone)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::HashFunction;
    use crate::Node;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes the root back as the "proof" after a delay.
    struct SlowBackend {
        delay: Duration,
        calls: AtomicUsize,
        caller: std::sync::Mutex<Option<thread::ThreadId>>,
    }

    impl ProofBackend for SlowBackend {
        fn prove(&self, witness: &Witness) -> Result<Vec<u8>, AttestationError> {
            *self.caller.lock().unwrap() = Some(thread::current().id());
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if witness.siblings.is_empty() {
                return Err(AttestationError::Proving("empty path".to_string()));
            }
            Ok(witness.root.to_vec())
        }

        fn verify(&self, proof: &[u8], root: &Node, _binding_value: &Node) -> bool {
            proof == root
        }
    }

    fn backend(delay_ms: u64) -> Arc<SlowBackend> {
        Arc::new(SlowBackend {
            delay: Duration::from_millis(delay_ms),
            calls: AtomicUsize::new(0),
            caller: std::sync::Mutex::new(None),
        })
    }

    fn witness(levels: usize) -> Witness {
        Witness {
            r: [1; 32],
            s: [2; 32],
            is_y_odd: false,
            msg_hash: [3; 32],
            siblings: vec![[4; 32]; levels],
            path_indices: vec![0; levels],
            root: [5; 32],
            binding_value: [6; 32],
            hash: HashFunction::Sha3_256,
        }
    }

    #[tokio::test]
    async fn test_proves_off_the_calling_thread() {
        let backend = backend(0);
        let worker = ProvingWorker::spawn(backend.clone()).unwrap();
        let proof = worker.prove(witness(3)).await.unwrap();
        assert_eq!(proof, vec![5; 32]);

        let proving_thread = backend.caller.lock().unwrap().unwrap();
        assert_ne!(proving_thread, thread::current().id());
    }

    #[tokio::test]
    async fn test_errors_are_returned_to_the_caller() {
        let worker = ProvingWorker::spawn(backend(0)).unwrap();
        assert!(matches!(
            worker.prove(witness(0)).await,
            Err(AttestationError::Proving(_))
        ));
        // The worker survives a failed job.
        assert!(worker.prove(witness(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_request_does_not_block_the_next() {
        let backend = backend(50);
        let worker = ProvingWorker::spawn(backend.clone()).unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(5), worker.prove(witness(2))).await;
        assert!(cancelled.is_err());

        let proof = worker.prove(witness(2)).await.unwrap();
        assert_eq!(proof.len(), 32);
        assert!(backend.calls.load(Ordering::SeqCst) <= 2);
    }
}
