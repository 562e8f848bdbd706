//! Buffered, cancellable consumer of a transport's byte stream
//!
//! A [StreamReader] owns the read side of a [Transport](crate::Transport).
//! Once started, a background task keeps pulling bytes from the
//! [ByteSource] and appends them to an internal buffer, but only while at
//! least one [ListenGuard] is alive. Anything arriving while nobody listens
//! (boot banners, stale replies) is dropped.
//!
//! Callers wait for data with [StreamReader::read] or for a complete SLIP
//! frame with [StreamReader::packet]. Only one such wait may be pending at a
//! time; a second one fails immediately with
//! [Error::ReadAlreadyInProgress] instead of queueing behind the first.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, warn};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout_at, Instant},
};

use crate::{
    buffer::{ByteBuffer, Escaping},
    error::{Error, TimedOutCommand},
    transport::{is_transient, ByteSource, ReadHandle},
};

const READ_CHUNK_SIZE: usize = 1024;
/// Delay before reopening the stream after end-of-stream or a line error
const RECOVERY_DELAY: Duration = Duration::from_millis(1);
/// Pause between attempts of [StreamReader::wait_silent]
const SILENCE_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Upper bound on frame extraction attempts in [StreamReader::packet]
const MAX_PACKET_ATTEMPTS: usize = 1000;

/// What the background read loop is currently doing
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No loop is running
    #[default]
    Stopped,
    /// Running, but no read handle is held
    Idle,
    /// Waiting on the read handle
    Reading,
    /// The last handle was released, waiting before reopening the stream
    Recovering,
}

#[derive(Debug, Default)]
struct State {
    buffer: ByteBuffer,
    listeners: usize,
    waiter: Option<oneshot::Sender<()>>,
    read_pending: bool,
    phase: ReaderState,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ReaderState) {
        self.lock().phase = phase;
    }

    fn deliver(&self, bytes: &[u8]) {
        let mut state = self.lock();
        if state.listeners > 0 {
            state.buffer.copy(bytes);
        }
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.send(());
        }
    }
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<io::Result<()>>,
}

/// Single consumer of a byte stream with a listen gate and one-at-a-time
/// waits
pub struct StreamReader {
    source: Arc<dyn ByteSource>,
    shared: Arc<Shared>,
    task: Mutex<Option<RunningLoop>>,
}

impl StreamReader {
    pub fn new(source: Arc<dyn ByteSource>) -> Self {
        StreamReader {
            source,
            shared: Arc::new(Shared::default()),
            task: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.lock()
    }

    fn task(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.reader_state() != ReaderState::Stopped
    }

    pub fn reader_state(&self) -> ReaderState {
        self.state().phase
    }

    /// Whether a loop was started and not yet collected by [stop](Self::stop)
    ///
    /// Stays `true` after the loop terminated on its own, until `stop`
    /// hands out the error it ended with.
    pub fn has_loop(&self) -> bool {
        self.task().is_some()
    }

    /// Spawn the background read loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), Error> {
        let mut task = self.task();
        if task.is_some() {
            return Err(Error::AlreadyRunning);
        }

        {
            let mut state = self.state();
            state.buffer.reset();
            state.phase = ReaderState::Idle;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(self.source.clone(), self.shared.clone(), stop_rx));
        *task = Some(RunningLoop { stop, handle });

        Ok(())
    }

    /// Stop the background loop and wait for it to exit
    ///
    /// A pending [read](Self::read) or [packet](Self::packet) fails with
    /// [Error::NotRunning]. If the loop had terminated on a transport error,
    /// that error is returned as `Ok(Some(_))`.
    pub async fn stop(&self) -> Result<Option<Error>, Error> {
        let running = self.task().take().ok_or(Error::NotRunning)?;

        // The loop may already have exited on its own
        let _ = running.stop.send(true);
        let outcome = running.handle.await;

        {
            let mut state = self.state();
            state.buffer.reset();
            state.waiter = None;
            state.phase = ReaderState::Stopped;
        }

        Ok(match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.into()),
            Err(join) => Some(io::Error::other(join).into()),
        })
    }

    /// Start buffering incoming bytes until the returned guard is dropped
    ///
    /// Guards nest; the buffer is cleared when the last one goes away.
    pub fn listen(&self) -> Result<ListenGuard, Error> {
        let mut state = self.state();
        if state.phase == ReaderState::Stopped {
            return Err(Error::NotRunning);
        }
        state.listeners += 1;

        Ok(ListenGuard {
            shared: self.shared.clone(),
        })
    }

    /// Wait for at least `min_length` bytes, then consume and return every
    /// buffered byte
    pub async fn read(&self, min_length: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;
        let _read = self.begin_read()?;

        self.wait_data(min_length, deadline).await?;

        // The state lock has to be released before `_read` drops
        let bytes = self.state().buffer.view(true);
        Ok(bytes)
    }

    /// Wait for the next complete SLIP frame and return it decoded
    ///
    /// While the buffered bytes don't contain a whole frame, the wait is
    /// repeated requiring one byte more than is currently buffered.
    pub async fn packet(&self, min_length: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;
        let _read = self.begin_read()?;

        let mut min_length = min_length;
        for _ in 0..MAX_PACKET_ATTEMPTS {
            self.wait_data(min_length, deadline).await?;

            let mut state = self.state();
            if let Some(frame) = state.buffer.packet(Escaping::Slip) {
                return Ok(frame);
            }
            min_length = state.buffer.len() + 1;
        }

        Err(Error::Timeout(TimedOutCommand::default()))
    }

    /// Wait for the line to go quiet
    ///
    /// Each attempt clears the buffer and waits up to `timeout` for a byte.
    /// Returns `true` on the first attempt that sees nothing, `false` if
    /// data kept arriving for all `retries` attempts.
    pub async fn wait_silent(&self, retries: usize, timeout: Duration) -> Result<bool, Error> {
        let _listen = self.listen()?;

        for _ in 0..retries {
            self.state().buffer.reset();

            match self.read(1, timeout).await {
                Err(Error::Timeout(_)) => return Ok(true),
                Err(err) => return Err(err),
                Ok(noise) => {
                    debug!("Line not silent yet, discarded {} bytes", noise.len());
                    sleep(SILENCE_RETRY_DELAY).await;
                }
            }
        }

        Ok(false)
    }

    fn begin_read(&self) -> Result<ReadGuard<'_>, Error> {
        let mut state = self.state();
        if state.listeners == 0 {
            return Err(Error::NotListening);
        }
        if state.read_pending {
            return Err(Error::ReadAlreadyInProgress);
        }
        state.read_pending = true;

        Ok(ReadGuard {
            shared: &self.shared,
        })
    }

    async fn wait_data(&self, min_length: usize, deadline: Instant) -> Result<(), Error> {
        loop {
            let woken = {
                let mut state = self.state();
                if state.buffer.len() >= min_length {
                    return Ok(());
                }
                if state.phase == ReaderState::Stopped {
                    return Err(Error::NotRunning);
                }

                let (waiter, woken) = oneshot::channel();
                state.waiter = Some(waiter);
                woken
            };

            match timeout_at(deadline, woken).await {
                Ok(Ok(())) => continue,
                // The loop dropped the waiter on its way out
                Ok(Err(_)) => return Err(Error::NotRunning),
                Err(_) => return Err(Error::Timeout(TimedOutCommand::default())),
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if let Some(running) = self.task().take() {
            running.handle.abort();
        }
    }
}

/// Keeps incoming bytes flowing into the reader's buffer while alive
#[must_use = "bytes are only buffered while the guard is held"]
#[derive(Debug)]
pub struct ListenGuard {
    shared: Arc<Shared>,
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        debug_assert!(state.listeners > 0, "listen count underflow");
        state.listeners = state.listeners.saturating_sub(1);
        if state.listeners == 0 {
            state.buffer.reset();
        }
    }
}

/// Marks a read as pending for as long as it is alive
struct ReadGuard<'a> {
    shared: &'a Shared,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.read_pending = false;
        state.waiter = None;
    }
}

async fn run(
    source: Arc<dyn ByteSource>,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut handle: Option<Box<dyn ReadHandle>> = None;
    let mut chunk = vec![0; READ_CHUNK_SIZE];

    let result = loop {
        if *stop.borrow() {
            break Ok(());
        }

        if handle.is_none() {
            match source.open() {
                Ok(reader) => handle = Some(reader),
                Err(err) if is_transient(&err) => {
                    debug!("Failed to open stream, retrying: {err}");
                    if !recover(&shared, &mut stop).await {
                        break Ok(());
                    }
                    continue;
                }
                Err(err) => break Err(err),
            }
        }
        let Some(reader) = handle.as_mut() else {
            continue;
        };

        shared.set_phase(ReaderState::Reading);
        let read = tokio::select! {
            _ = stop.changed() => break Ok(()),
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                debug!("End of stream, reopening");
                handle = None;
                if !recover(&shared, &mut stop).await {
                    break Ok(());
                }
            }
            Ok(n) => shared.deliver(&chunk[..n]),
            Err(err) if is_transient(&err) => {
                debug!("Transient read error, reopening: {err}");
                handle = None;
                if !recover(&shared, &mut stop).await {
                    break Ok(());
                }
            }
            Err(err) => {
                warn!("Stream reader terminated: {err}");
                break Err(err);
            }
        }
    };

    let mut state = shared.lock();
    state.phase = ReaderState::Stopped;
    state.waiter = None;

    result
}

/// Back off before the stream is reopened; `false` if a stop came in
async fn recover(shared: &Shared, stop: &mut watch::Receiver<bool>) -> bool {
    shared.set_phase(ReaderState::Recovering);

    let resumed = tokio::select! {
        _ = stop.changed() => false,
        _ = sleep(RECOVERY_DELAY) => true,
    };
    if resumed {
        shared.set_phase(ReaderState::Idle);
    }

    resumed
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::{
        channel::{channel, DeviceEnd, Incoming},
        LineError, Transport,
    };

    fn reader() -> (Arc<StreamReader>, DeviceEnd) {
        let (transport, device) = channel(115_200);

        (Arc::new(StreamReader::new(transport.source())), device)
    }

    async fn settle() {
        sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_lifecycle() {
        let (reader, _device) = reader();

        assert!(matches!(reader.stop().await, Err(Error::NotRunning)));
        assert!(matches!(reader.listen(), Err(Error::NotRunning)));

        reader.start().unwrap();
        assert!(matches!(reader.start(), Err(Error::AlreadyRunning)));
        assert!(reader.is_running());

        assert!(reader.stop().await.unwrap().is_none());
        assert!(!reader.is_running());
        assert!(matches!(reader.stop().await, Err(Error::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn read_requires_listener() {
        let (reader, device) = reader();
        reader.start().unwrap();

        device.send(vec![1, 2, 3]);
        settle().await;

        assert!(matches!(
            reader.read(1, Duration::from_millis(10)).await,
            Err(Error::NotListening)
        ));
        assert!(matches!(
            reader.packet(1, Duration::from_millis(10)).await,
            Err(Error::NotListening)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_returns_buffered_bytes() {
        let (reader, device) = reader();
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();

        device.send(vec![1, 2]);
        device.send(vec![3]);

        let bytes = reader.read(3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn successful_read_returns() {
        let (done, outcome) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let result = runtime.block_on(async {
                let (reader, device) = reader();
                reader.start().unwrap();
                let _listen = reader.listen().unwrap();

                device.send(vec![1, 2, 3]);
                reader.read(3, Duration::from_secs(1)).await
            });
            let _ = done.send(result.map_err(|err| err.to_string()));
        });

        let result = outcome
            .recv_timeout(Duration::from_secs(5))
            .expect("read() did not return");
        assert_eq!(result, Ok(vec![1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out() {
        let (reader, device) = reader();
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();

        device.send(vec![1]);

        assert!(matches!(
            reader.read(2, Duration::from_millis(100)).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn bytes_are_dropped_without_listener() {
        let (reader, device) = reader();
        reader.start().unwrap();

        device.send(vec![0xAA]);
        settle().await;

        let _listen = reader.listen().unwrap();
        assert!(matches!(
            reader.read(1, Duration::from_millis(50)).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn last_listener_clears_buffer() {
        let (reader, device) = reader();
        reader.start().unwrap();

        let outer = reader.listen().unwrap();
        let inner = reader.listen().unwrap();
        device.send(vec![1]);
        settle().await;

        drop(inner);
        assert_eq!(
            reader.read(1, Duration::from_millis(50)).await.unwrap(),
            vec![1]
        );

        device.send(vec![2]);
        settle().await;
        drop(outer);

        let _listen = reader.listen().unwrap();
        assert!(matches!(
            reader.read(1, Duration::from_millis(50)).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_is_rejected() {
        let (reader, device) = reader();
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();

        let first = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read(1, Duration::from_secs(10)).await }
        });
        settle().await;

        assert!(matches!(
            reader.read(1, Duration::from_secs(1)).await,
            Err(Error::ReadAlreadyInProgress)
        ));
        assert!(matches!(
            reader.packet(1, Duration::from_secs(1)).await,
            Err(Error::ReadAlreadyInProgress)
        ));

        device.send(vec![7]);
        assert_eq!(first.await.unwrap().unwrap(), vec![7]);

        // The slot is free again
        device.send(vec![8]);
        assert_eq!(
            reader.read(1, Duration::from_secs(1)).await.unwrap(),
            vec![8]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_read() {
        let (reader, _device) = reader();
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();

        let pending = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read(1, Duration::from_secs(60)).await }
        });
        settle().await;

        let stopped = tokio::time::timeout(Duration::from_secs(1), reader.stop())
            .await
            .expect("stop hangs");
        assert!(stopped.unwrap().is_none());
        assert!(matches!(pending.await.unwrap(), Err(Error::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_transient_errors_and_eof() {
        let (reader, device) = reader();
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();

        device.send_incoming(Incoming::Error(LineError::Framing.into()));
        device.send_incoming(Incoming::Eof);
        device.send_incoming(Incoming::Error(io::ErrorKind::Interrupted.into()));
        device.send(vec![9]);

        assert_eq!(
            reader.read(1, Duration::from_secs(1)).await.unwrap(),
            vec![9]
        );
        assert!(reader.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_reported_by_stop() {
        let (reader, device) = reader();
        reader.start().unwrap();

        device.send_incoming(Incoming::Error(io::ErrorKind::BrokenPipe.into()));
        settle().await;

        assert_eq!(reader.reader_state(), ReaderState::Stopped);
        assert!(!reader.is_running());
        assert!(reader.has_loop());

        let err = reader.stop().await.unwrap();
        assert!(matches!(err, Some(Error::Connection(_))));
        assert!(!reader.has_loop());

        // Collected, so the reader can run again
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();
        device.send(vec![4]);
        assert_eq!(
            reader.read(1, Duration::from_secs(1)).await.unwrap(),
            vec![4]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn packet_decodes_frames_split_across_reads() {
        let (reader, device) = reader();
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();

        device.send(vec![0xC0, 0x01, 0xDB]);
        device.send(vec![0xDC, 0x02]);
        device.send(vec![0xC0, 0xC0, 0x05]);

        let frame = reader.packet(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, vec![0x01, 0xC0, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn packet_times_out_without_frame() {
        let (reader, device) = reader();
        reader.start().unwrap();
        let _listen = reader.listen().unwrap();

        device.send(vec![0xC0, 0x01, 0x02]);

        assert!(matches!(
            reader.packet(1, Duration::from_millis(200)).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_silent_on_quiet_line() {
        let (reader, _device) = reader();
        reader.start().unwrap();

        assert!(reader
            .wait_silent(3, Duration::from_millis(20))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_silent_gives_up_on_noisy_line() {
        let (reader, device) = reader();
        reader.start().unwrap();

        let tx = device.sender();
        let noise = tokio::spawn(async move {
            for _ in 0..100 {
                if tx.send(Incoming::Data(b"boot".to_vec())).is_err() {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        });

        assert!(!reader
            .wait_silent(2, Duration::from_millis(20))
            .await
            .unwrap());
        noise.abort();
    }
}
