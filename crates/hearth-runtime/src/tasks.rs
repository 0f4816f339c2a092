use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

/// A host-defined unit of work run on the engine thread, inside the active context
pub type Task = Box<dyn FnOnce(&mut v8::HandleScope)>;

/// Due time for delays too large to represent
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct Queues {
    ready: VecDeque<Task>,
    delayed: BinaryHeap<Reverse<Delayed>>,
}

/// Macro-task queue drained by the frame pump.
///
/// Delayed tasks become ready once their due time has passed; tasks with the
/// same due time run in the order they were posted.
#[derive(Default)]
pub struct TaskQueue {
    queues: RefCell<Queues>,
    next_seq: Cell<u64>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, task: Task) {
        self.queues.borrow_mut().ready.push_back(task);
    }

    pub fn post_delayed(&self, task: Task, delay: Duration) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let now = Instant::now();
        let due = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.queues.borrow_mut().delayed.push(Reverse(Delayed { due, seq, task }));
    }

    /// Runs at most one task that is ready now. Returns whether a task ran.
    pub fn run_one(&self, scope: &mut v8::HandleScope) -> bool {
        let next = {
            let mut queues = self.queues.borrow_mut();
            let now = Instant::now();
            while queues
                .delayed
                .peek()
                .is_some_and(|Reverse(delayed)| delayed.due <= now)
            {
                if let Some(Reverse(delayed)) = queues.delayed.pop() {
                    queues.ready.push_back(delayed.task);
                }
            }
            queues.ready.pop_front()
        };

        // Tasks may post more tasks, so the borrow is released before running
        match next {
            Some(task) => {
                task(scope);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        let queues = self.queues.borrow();
        queues.ready.len() + queues.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.queues.borrow_mut());
        drop(drained);
    }
}

/// Converts a delay in seconds to a `Duration`. Negative and NaN delays run
/// immediately; delays past the `Duration` range saturate.
pub fn delay_from_secs(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}
