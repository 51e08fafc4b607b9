use parking_lot::{Condvar, Mutex};

/// A reader-writer latch with explicit, unguarded enter and exit.
///
/// Unlike a guard-based lock, a read hold is not tied to a thread: the pool
/// configuration lock is entered by the thread that starts a logical device
/// I/O and exited by whichever thread assesses its completion. Writers are
/// preferred: once a writer is waiting, new readers queue behind it.
pub struct ReaderWriterLatch {
    state: Mutex<LatchState>,
    cv: Condvar,
}

#[derive(Default)]
struct LatchState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

impl ReaderWriterLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            cv: Condvar::new(),
        }
    }

    /// Acquires a read hold, blocking while a writer holds or waits for the latch.
    pub fn r_lock(&self) {
        let mut state = self.state.lock();
        while state.writer || state.writers_waiting > 0 {
            self.cv.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Releases one read hold. May be called from any thread.
    pub fn r_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "r_unlock without a read hold");
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.cv.notify_all();
        }
    }

    /// Acquires the write hold, blocking until all readers have exited.
    pub fn w_lock(&self) {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.cv.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
    }

    pub fn w_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "w_unlock without the write hold");
        state.writer = false;
        self.cv.notify_all();
    }

    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }
}

impl Default for ReaderWriterLatch {
    fn default() -> Self {
        Self::new()
    }
}
