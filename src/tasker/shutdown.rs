//! Blocking wait for termination signals, followed by ordered cleanup.
//!
//! A [`ShutdownHook`] is a plain value: it watches nothing until [`ShutdownHook::close`]
//! (or [`ShutdownHook::wait`]) is called. Its wake-up handlers are removed before
//! that call returns; from then on the watched signals take their default action.
//!
//! ```no_run
//! use nix::sys::signal::Signal;
//! use tsvc::tasker::shutdown::{callback, ShutdownHook};
//!
//! ShutdownHook::new()
//!     .with_signals([Signal::SIGHUP, Signal::SIGQUIT])
//!     .close([callback(|| {
//!         println!("do something before shutdown");
//!         Ok(())
//!     })])
//!     .unwrap();
//! ```

use std::error::Error as StdError;
use std::fmt;
use std::io;

use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error a cleanup callback may return. Anything implementing `Error` converts with `?`.
pub type CallbackError = Box<dyn StdError + Send + Sync>;

/// A cleanup procedure run once after a watched signal arrives.
pub type Callback<'a> = Box<dyn FnOnce() -> Result<(), CallbackError> + 'a>;

/// Boxes a closure as a [`Callback`].
pub fn callback<'a, F>(f: F) -> Callback<'a>
where
    F: FnOnce() -> Result<(), CallbackError> + 'a,
{
    Box::new(f)
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to register handler for {signal}: {source}")]
    Register {
        signal: Signal,
        #[source]
        source: io::Error,
    },
    #[error("failed while waiting for a termination signal: {0}")]
    Wait(#[source] io::Error),
    #[error("woken by unrecognised signal number {0}")]
    UnknownSignal(i32),
    #[error("cleanup callback #{index} failed: {source}")]
    Callback {
        index: usize,
        #[source]
        source: CallbackError,
    },
}

/// Set of signals a hook waits for. Duplicates collapse, insertion order is kept.
#[derive(Debug, Clone)]
pub struct SignalSet(Vec<Signal>);

impl SignalSet {
    pub fn empty() -> SignalSet {
        SignalSet(Vec::new())
    }

    /// Adds `signal`, returning `false` if it was already present.
    pub fn insert(&mut self, signal: Signal) -> bool {
        if self.contains(signal) {
            return false;
        }
        self.0.push(signal);
        true
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.0.contains(&signal)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Signal> + '_ {
        self.0.iter().copied()
    }
}

impl Default for SignalSet {
    /// `SIGINT` and `SIGTERM`.
    fn default() -> SignalSet {
        [Signal::SIGINT, Signal::SIGTERM].into_iter().collect()
    }
}

impl FromIterator<Signal> for SignalSet {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> SignalSet {
        let mut set = SignalSet::empty();
        for signal in iter {
            set.insert(signal);
        }
        set
    }
}

impl PartialEq for SignalSet {
    fn eq(&self, other: &SignalSet) -> bool {
        self.len() == other.len() && self.iter().all(|s| other.contains(s))
    }
}

impl Eq for SignalSet {}

impl fmt::Display for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, signal) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", signal)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
mod platform {
    use std::io::{self, Read};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use nix::sys::signal::Signal;
    use signal_hook::consts::FORBIDDEN;
    use signal_hook::low_level::{self, pipe};
    use signal_hook::{flag, SigId};

    use super::{ShutdownError, SignalSet};

    /// Handlers installed for one wait. Dropping it unregisters them.
    pub struct Registration {
        ids: Vec<SigId>,
        last: Arc<AtomicUsize>,
        wake: UnixStream,
    }

    impl Registration {
        pub fn install(signals: &SignalSet) -> Result<Registration, ShutdownError> {
            let (wake, notify) = UnixStream::pair().map_err(ShutdownError::Wait)?;
            notify.set_nonblocking(true).map_err(ShutdownError::Wait)?;

            let mut registration = Registration {
                ids: Vec::with_capacity(signals.len() * 2),
                last: Arc::new(AtomicUsize::new(0)),
                wake,
            };

            for signal in signals.iter() {
                let raw = signal as i32;
                let register_err = |source| ShutdownError::Register { signal, source };
                if FORBIDDEN.contains(&raw) {
                    return Err(register_err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "signal cannot be handled",
                    )));
                }

                // The flag must be set before the wake byte is written.
                let id = flag::register_usize(raw, Arc::clone(&registration.last), raw as usize)
                    .map_err(register_err)?;
                registration.ids.push(id);

                let notify = notify.try_clone().map_err(register_err)?;
                let id = pipe::register(raw, notify).map_err(register_err)?;
                registration.ids.push(id);
            }

            Ok(registration)
        }

        pub fn wait(&mut self) -> Result<Signal, ShutdownError> {
            let mut byte = [0u8; 1];
            loop {
                match self.wake.read(&mut byte) {
                    Ok(0) => {
                        return Err(ShutdownError::Wait(io::ErrorKind::UnexpectedEof.into()));
                    }
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ShutdownError::Wait(e)),
                }
            }

            let raw = self.last.load(Ordering::SeqCst) as i32;
            Signal::try_from(raw).map_err(|_| ShutdownError::UnknownSignal(raw))
        }

        /// Makes the next delivery of any watched signal take its default
        /// action. These handlers stay for the rest of the process.
        pub fn arm_default(&self, signals: &SignalSet) -> Result<(), ShutdownError> {
            let armed = Arc::new(AtomicBool::new(true));
            for signal in signals.iter() {
                flag::register_conditional_default(signal as i32, Arc::clone(&armed))
                    .map_err(|source| ShutdownError::Register { signal, source })?;
            }
            Ok(())
        }
    }

    impl Drop for Registration {
        fn drop(&mut self) {
            for id in self.ids.drain(..) {
                low_level::unregister(id);
            }
        }
    }
}

/// Waits for a termination signal, then runs cleanup callbacks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHook {
    signals: SignalSet,
}

impl ShutdownHook {
    /// A hook watching `SIGINT` and `SIGTERM`.
    pub fn new() -> ShutdownHook {
        ShutdownHook::default()
    }

    /// Replaces the watched set. An empty list leaves the current set in place.
    #[must_use]
    pub fn with_signals<I>(self, signals: I) -> ShutdownHook
    where
        I: IntoIterator<Item = Signal>,
    {
        let signals: SignalSet = signals.into_iter().collect();
        if signals.is_empty() {
            warn!(current = %self.signals, "empty signal list ignored");
            return self;
        }

        debug!(signals = %signals, "watched signal set replaced");
        ShutdownHook { signals }
    }

    pub fn signals(&self) -> &SignalSet {
        &self.signals
    }

    /// Blocks until one of the watched signals is delivered to the process.
    ///
    /// There is no timeout. Once the wait ends, a second delivery of any
    /// watched signal takes that signal's default action, so a repeated
    /// Ctrl-C still terminates a process stuck in cleanup.
    pub fn wait(&self) -> Result<Signal, ShutdownError> {
        let mut registration = platform::Registration::install(&self.signals)?;
        info!(signals = %self.signals, "waiting for termination signal");

        let signal = registration.wait()?;
        registration.arm_default(&self.signals)?;
        drop(registration);

        info!(%signal, "termination signal received");
        Ok(signal)
    }

    /// Blocks until a watched signal arrives, then runs `callbacks` in order on
    /// the calling thread.
    ///
    /// The first failing callback stops the sequence; its error is returned
    /// and the callbacks after it never run.
    pub fn close<'a, I>(self, callbacks: I) -> Result<Signal, ShutdownError>
    where
        I: IntoIterator<Item = Callback<'a>>,
    {
        let signal = self.wait()?;
        run_callbacks(callbacks)?;
        info!("shutdown callbacks complete");
        Ok(signal)
    }
}

/// Runs `callbacks` in order, stopping at the first error.
pub fn run_callbacks<'a, I>(callbacks: I) -> Result<(), ShutdownError>
where
    I: IntoIterator<Item = Callback<'a>>,
{
    for (index, callback) in callbacks.into_iter().enumerate() {
        debug!(index, "running cleanup callback");
        callback().map_err(|source| ShutdownError::Callback { index, source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn default_watches_interrupt_and_terminate() {
        let hook = ShutdownHook::new();
        let expected: SignalSet = [Signal::SIGINT, Signal::SIGTERM].into_iter().collect();
        assert_eq!(hook.signals(), &expected);
        assert_eq!(hook.signals().len(), 2);
    }

    #[test]
    fn with_signals_replaces_set() {
        let hook = ShutdownHook::new().with_signals([Signal::SIGHUP, Signal::SIGQUIT]);
        assert!(hook.signals().contains(Signal::SIGHUP));
        assert!(hook.signals().contains(Signal::SIGQUIT));
        assert!(!hook.signals().contains(Signal::SIGINT));
        assert!(!hook.signals().contains(Signal::SIGTERM));
    }

    #[test]
    fn with_signals_collapses_duplicates() {
        let hook = ShutdownHook::new().with_signals([
            Signal::SIGQUIT,
            Signal::SIGHUP,
            Signal::SIGQUIT,
        ]);
        let expected: SignalSet = [Signal::SIGHUP, Signal::SIGQUIT].into_iter().collect();
        assert_eq!(hook.signals().len(), 2);
        assert_eq!(hook.signals(), &expected);
    }

    #[test]
    fn empty_signal_list_is_ignored() {
        let hook = ShutdownHook::new()
            .with_signals([Signal::SIGUSR1])
            .with_signals(Vec::new());
        let expected: SignalSet = [Signal::SIGUSR1].into_iter().collect();
        assert_eq!(hook.signals(), &expected);
    }

    #[test]
    fn signal_set_display_keeps_insertion_order() {
        let set: SignalSet = [Signal::SIGTERM, Signal::SIGINT].into_iter().collect();
        assert_eq!(set.to_string(), "SIGTERM, SIGINT");
    }

    #[test]
    fn callbacks_run_in_order() {
        let order = RefCell::new(Vec::new());
        let log = &order;
        let callbacks = ["A", "B", "C"].map(|name| {
            callback(move || {
                log.borrow_mut().push(name);
                Ok(())
            })
        });

        run_callbacks(callbacks).unwrap();
        assert_eq!(*order.borrow(), vec!["A", "B", "C"]);
    }

    #[test]
    fn failing_callback_skips_the_rest() {
        let order = RefCell::new(Vec::new());
        let callbacks = vec![
            callback(|| {
                order.borrow_mut().push("A");
                Ok(())
            }),
            callback(|| {
                order.borrow_mut().push("B");
                Err("flush failed".into())
            }),
            callback(|| {
                order.borrow_mut().push("C");
                Ok(())
            }),
        ];

        let err = run_callbacks(callbacks).unwrap_err();
        match err {
            ShutdownError::Callback { index, source } => {
                assert_eq!(index, 1);
                assert_eq!(source.to_string(), "flush failed");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*order.borrow(), vec!["A", "B"]);
    }

    #[test]
    fn no_callbacks_is_fine() {
        run_callbacks(Vec::new()).unwrap();
    }
}
