use crossbeam::channel::{Sender, unbounded};
use std::thread::{Builder, Scope};

type Task<'scope> = Box<dyn 'scope + Send + FnOnce()>;

/// Fixed-size pool of scoped worker threads consuming fire-and-forget tasks.
///
/// Tasks may borrow from the enclosing `std::thread::scope`, which is what
/// lets a node submit per-slot hash jobs that reference the node itself.
/// Barrier semantics for a known set of submitted tasks are the caller's
/// concern (`crossbeam::sync::WaitGroup`); the pool only runs them.
pub struct ThreadPool<'scope> {
    sender: Sender<Task<'scope>>,
    worker_count: usize,
}

impl<'scope> ThreadPool<'scope> {
    pub fn new(thread_count: usize, scope: &'scope Scope<'scope, '_>) -> Self {
        let (sender, receiver) = unbounded::<Task<'scope>>();

        for i in 0..thread_count {
            let receiver = receiver.clone();
            let _ = Builder::new()
                .name(format!("smt-worker-{i}"))
                .spawn_scoped(scope, move || {
                    // Workers drain until every sender is gone, so tasks
                    // queued at drop time still run before the scope ends.
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                });
        }
        ThreadPool {
            sender,
            worker_count: thread_count,
        }
    }

    pub fn execute(&self, task: Task<'scope>) {
        // Workers hold the receiver for the lifetime of the scope, so the
        // channel cannot be disconnected while the pool exists.
        let _ = self.sender.send(task);
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}
