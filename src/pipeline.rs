//! Assistant pipeline.
//!
//! The scan engine must stay I/O-bound: it prefetches verification work and
//! hands it to a dedicated assistant thread per checker, which may block on
//! locks, peer calls and transactions. The two sides meet at a bounded FIFO
//! plus a pair of condition variables. Event flags ride the same lock and
//! are served by the consumer in strict priority: exit, then end-of-phase-1,
//! then phase-2, then plain requests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::errno::{Errno, Result};

/// How often a waiting phase-2 assistant re-polls its peers.
const PHASE2_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// The verify/repair half of a checker, driven by the assistant thread.
pub(crate) trait AssistantHandler: Send + 'static {
    type Req: Send + 'static;

    fn name(&self) -> &'static str;

    /// Runs once on the assistant thread before any request: peer START
    /// fan-out and per-run state.
    fn prep(&mut self) -> Result<()>;

    fn handle_req(&mut self, req: Self::Req) -> Result<()>;

    /// The producer finished phase-1 with `result` (`> 0` = full sweep).
    /// Peer notifications happen here.
    fn phase1_done(&mut self, result: i32) -> Result<()>;

    /// One phase-2 attempt. `Ok(0)` = still waiting on peers (the loop
    /// will call again on a peer event or after the poll interval);
    /// `Ok(n > 0)` = phase-2 complete.
    fn phase2_try(&mut self) -> Result<i32>;

    /// A request thrown away because the assistant is exiting.
    fn drain_req(&mut self, req: Self::Req);

    /// Final peer notification before the thread ends.
    fn on_exit(&mut self);
}

struct PipeState<R> {
    queue: VecDeque<R>,
    windows: u32,
    /// Assistant health; negative errno once the assistant has failed.
    status: i32,
    to_post: bool,
    post_result: i32,
    post_acked: bool,
    to_double_scan: bool,
    in_double_scan: bool,
    ds_done: bool,
    /// A peer event arrived; retry phase-2 promptly.
    poke: bool,
    exit: bool,
    exited: bool,
}

/// Bounded single-consumer request queue between the engine and one
/// assistant.
pub(crate) struct Pipeline<R> {
    state: Mutex<PipeState<R>>,
    consumer_cv: Condvar,
    producer_cv: Condvar,
}

impl<R: Send + 'static> Pipeline<R> {
    pub fn new(windows: u32) -> Pipeline<R> {
        Pipeline {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                windows: windows.max(2),
                status: 0,
                to_post: false,
                post_result: 0,
                post_acked: false,
                to_double_scan: false,
                in_double_scan: false,
                ds_done: false,
                poke: false,
                exit: false,
                exited: false,
            }),
            consumer_cv: Condvar::new(),
            producer_cv: Condvar::new(),
        }
    }

    /// Enqueue one unit of work, blocking while the window is full.
    pub fn push(&self, req: R) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            if st.exit || st.exited {
                return Err(Errno::ESHUTDOWN);
            }
            if st.status < 0 {
                return Err(Errno::from_raw(st.status));
            }
            if (st.queue.len() as u32) < st.windows {
                break;
            }
            self.producer_cv.wait(&mut st);
        }
        let was_empty = st.queue.is_empty();
        st.queue.push_back(req);
        if was_empty {
            self.consumer_cv.notify_one();
        }
        Ok(())
    }

    /// Tell the assistant phase-1 is over and wait for it to acknowledge
    /// (after peer notification).
    pub fn post(&self, result: i32) -> Result<()> {
        let mut st = self.state.lock();
        if st.exited {
            return Err(Errno::ESHUTDOWN);
        }
        st.to_post = true;
        st.post_result = result;
        st.post_acked = false;
        self.consumer_cv.notify_one();
        while !st.post_acked && !st.exited {
            self.producer_cv.wait(&mut st);
        }
        if st.status < 0 {
            return Err(Errno::from_raw(st.status));
        }
        Ok(())
    }

    /// Enter phase-2 and block until the assistant finishes it (or exits).
    pub fn double_scan(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.exited && !st.ds_done {
            return Err(Errno::ESHUTDOWN);
        }
        st.to_double_scan = true;
        self.consumer_cv.notify_one();
        while !st.ds_done && !st.exited {
            self.producer_cv.wait(&mut st);
        }
        if st.status < 0 {
            return Err(Errno::from_raw(st.status));
        }
        Ok(())
    }

    /// Checkpoint barrier: block until everything prefetched so far has
    /// been consumed.
    pub fn wait_drained(&self) {
        let mut st = self.state.lock();
        while !st.queue.is_empty() && !st.exited {
            self.producer_cv.wait(&mut st);
        }
    }

    /// Queue depth, for backpressure observation.
    pub fn prefetched(&self) -> u32 {
        self.state.lock().queue.len() as u32
    }

    /// A peer event arrived: re-run the phase-2 attempt promptly.
    pub fn poke(&self) {
        let mut st = self.state.lock();
        st.poke = true;
        self.consumer_cv.notify_one();
    }

    pub fn request_exit(&self) {
        let mut st = self.state.lock();
        st.exit = true;
        self.consumer_cv.notify_all();
        self.producer_cv.notify_all();
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().exited
    }
}

enum Work<R> {
    Req(R),
    Post(i32),
    DsTry,
    Exit,
}

/// The assistant thread body. Runs until phase-2 completes or an exit is
/// requested, then drains and sends the final notification.
pub(crate) fn assistant_loop<H: AssistantHandler>(pipeline: Arc<Pipeline<H::Req>>, mut handler: H) {
    debug!("{}: assistant starting", handler.name());
    if let Err(e) = handler.prep() {
        warn!("{}: assistant prep failed: {}", handler.name(), e);
        let mut st = pipeline.state.lock();
        st.status = e.to_wire();
        st.exit = true;
        pipeline.producer_cv.notify_all();
    }

    loop {
        let work = {
            let mut st = pipeline.state.lock();
            loop {
                if st.exit {
                    break Work::Exit;
                }
                if let Some(req) = st.queue.pop_front() {
                    if st.queue.is_empty() || (st.queue.len() as u32) < st.windows / 2 {
                        pipeline.producer_cv.notify_all();
                    }
                    break Work::Req(req);
                }
                // The queue is drained; anyone in the checkpoint barrier
                // may proceed.
                pipeline.producer_cv.notify_all();
                if st.to_post {
                    st.to_post = false;
                    break Work::Post(st.post_result);
                }
                if st.to_double_scan {
                    st.to_double_scan = false;
                    st.in_double_scan = true;
                    break Work::DsTry;
                }
                if st.in_double_scan {
                    if st.poke {
                        st.poke = false;
                        break Work::DsTry;
                    }
                    if wait_timeout(&pipeline.consumer_cv, &mut st, PHASE2_POLL_INTERVAL) {
                        break Work::DsTry;
                    }
                    continue;
                }
                pipeline.consumer_cv.wait(&mut st);
            }
        };

        match work {
            Work::Exit => break,
            Work::Req(req) => {
                if let Err(e) = handler.handle_req(req) {
                    warn!("{}: assistant failed: {}", handler.name(), e);
                    let mut st = pipeline.state.lock();
                    st.status = e.to_wire();
                    st.exit = true;
                    pipeline.producer_cv.notify_all();
                }
            }
            Work::Post(result) => {
                let rc = handler.phase1_done(result);
                let mut st = pipeline.state.lock();
                if let Err(e) = rc {
                    st.status = e.to_wire();
                    st.exit = true;
                }
                if result <= 0 {
                    // Incomplete sweep: nothing to double-scan.
                    st.exit = true;
                }
                st.post_acked = true;
                pipeline.producer_cv.notify_all();
            }
            Work::DsTry => match handler.phase2_try() {
                Ok(0) => {}
                Ok(_) => {
                    let mut st = pipeline.state.lock();
                    st.in_double_scan = false;
                    st.ds_done = true;
                    st.exit = true;
                    pipeline.producer_cv.notify_all();
                }
                Err(e) => {
                    warn!("{}: phase-2 failed: {}", handler.name(), e);
                    let mut st = pipeline.state.lock();
                    st.status = e.to_wire();
                    st.in_double_scan = false;
                    st.ds_done = true;
                    st.exit = true;
                    pipeline.producer_cv.notify_all();
                }
            },
        }
    }

    // Exit path: throw away whatever is still queued, tell peers, release
    // every waiter.
    let leftovers: Vec<H::Req> = {
        let mut st = pipeline.state.lock();
        st.queue.drain(..).collect()
    };
    for req in leftovers {
        handler.drain_req(req);
    }
    handler.on_exit();
    let mut st = pipeline.state.lock();
    st.exited = true;
    st.ds_done = true;
    st.post_acked = true;
    pipeline.producer_cv.notify_all();
    pipeline.consumer_cv.notify_all();
    debug!("{}: assistant exited", handler.name());
}

fn wait_timeout<R>(
    cv: &Condvar,
    st: &mut parking_lot::MutexGuard<'_, PipeState<R>>,
    dur: Duration,
) -> bool {
    cv.wait_for(st, dur).timed_out()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        handled: Arc<AtomicU32>,
        drained: Arc<AtomicU32>,
        p2_rounds: u32,
    }

    impl AssistantHandler for Counting {
        type Req = u32;

        fn name(&self) -> &'static str {
            "test"
        }

        fn prep(&mut self) -> Result<()> {
            Ok(())
        }

        fn handle_req(&mut self, _req: u32) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn phase1_done(&mut self, _result: i32) -> Result<()> {
            Ok(())
        }

        fn phase2_try(&mut self) -> Result<i32> {
            self.p2_rounds += 1;
            Ok(1)
        }

        fn drain_req(&mut self, _req: u32) {
            self.drained.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exit(&mut self) {}
    }

    fn spawn(handler: Counting) -> (Arc<Pipeline<u32>>, std::thread::JoinHandle<()>) {
        let pipeline = Arc::new(Pipeline::new(8));
        let p2 = pipeline.clone();
        let join = std::thread::spawn(move || assistant_loop(p2, handler));
        (pipeline, join)
    }

    #[test]
    fn requests_flow_then_phases_complete() {
        let handled = Arc::new(AtomicU32::new(0));
        let drained = Arc::new(AtomicU32::new(0));
        let (pipeline, join) = spawn(Counting {
            handled: handled.clone(),
            drained: drained.clone(),
            p2_rounds: 0,
        });

        for i in 0..20 {
            pipeline.push(i).unwrap();
        }
        pipeline.wait_drained();
        assert_eq!(handled.load(Ordering::SeqCst), 20);

        pipeline.post(1).unwrap();
        pipeline.double_scan().unwrap();
        join.join().unwrap();
        assert!(pipeline.has_exited());
        assert_eq!(drained.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_sweep_stops_the_assistant() {
        let handled = Arc::new(AtomicU32::new(0));
        let drained = Arc::new(AtomicU32::new(0));
        let (pipeline, join) = spawn(Counting {
            handled: handled.clone(),
            drained,
            p2_rounds: 0,
        });
        pipeline.post(0).unwrap();
        join.join().unwrap();
        assert_eq!(pipeline.push(1), Err(Errno::ESHUTDOWN));
    }

    #[test]
    fn exit_drains_queue() {
        struct Slow {
            drained: Arc<AtomicU32>,
        }

        impl AssistantHandler for Slow {
            type Req = u32;

            fn name(&self) -> &'static str {
                "slow"
            }

            fn prep(&mut self) -> Result<()> {
                Ok(())
            }

            fn handle_req(&mut self, _req: u32) -> Result<()> {
                std::thread::sleep(Duration::from_millis(20));
                Ok(())
            }

            fn phase1_done(&mut self, _result: i32) -> Result<()> {
                Ok(())
            }

            fn phase2_try(&mut self) -> Result<i32> {
                Ok(1)
            }

            fn drain_req(&mut self, _req: u32) {
                self.drained.fetch_add(1, Ordering::SeqCst);
            }

            fn on_exit(&mut self) {}
        }

        let drained = Arc::new(AtomicU32::new(0));
        let pipeline = Arc::new(Pipeline::new(16));
        let p2 = pipeline.clone();
        let d2 = drained.clone();
        let join = std::thread::spawn(move || assistant_loop(p2, Slow { drained: d2 }));
        for i in 0..10 {
            pipeline.push(i).unwrap();
        }
        pipeline.request_exit();
        join.join().unwrap();
        // Whatever the consumer had not started yet was drained, not lost.
        assert!(drained.load(Ordering::SeqCst) > 0);
    }
}
