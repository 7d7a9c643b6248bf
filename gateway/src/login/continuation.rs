use crate::error::LoginError;
use parley_types::Step;
use std::time::Duration;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;

pub type Outcome = Result<String, LoginError>;

/// A suspended login step waiting for exactly one external input.
///
/// Consuming methods guarantee the resolver fires at most once. Each of them
/// also stops the step's deadline timer.
pub struct Continuation {
    step: Step,
    ticket: u64,
    resolver: oneshot::Sender<Outcome>,
    timer: CancellationToken,
    deadline: Instant,
}

impl Continuation {
    /// Returns the continuation and the receiver the suspended hook awaits.
    pub fn new(step: Step, ticket: u64, timeout: Duration) -> (Self, oneshot::Receiver<Outcome>) {
        let (resolver, rx) = oneshot::channel();
        let continuation = Self {
            step,
            ticket,
            resolver,
            timer: CancellationToken::new(),
            deadline: Instant::now() + timeout,
        };
        (continuation, rx)
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Distinguishes this continuation from earlier ones for the same step, so
    /// a stale timer cannot expire a newer wait.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancelled once the continuation is consumed.
    pub fn timer(&self) -> CancellationToken {
        self.timer.clone()
    }

    /// Hands `value` to the suspended hook. `false` if the hook already went
    /// away, in which case the value is dropped.
    pub fn resume(self, value: String) -> bool {
        self.timer.cancel();
        self.resolver.send(Ok(value)).is_ok()
    }

    pub fn expire(self) {
        self.timer.cancel();
        let _ = self.resolver.send(Err(LoginError::StepTimeout));
    }

    pub fn cancel(self) {
        self.timer.cancel();
        let _ = self.resolver.send(Err(LoginError::Cancelled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_delivers_value_and_stops_timer() {
        let (continuation, rx) = Continuation::new(Step::Code, 1, Duration::from_secs(5));
        let timer = continuation.timer();
        assert!(continuation.resume("12345".into()));
        assert!(timer.is_cancelled());
        assert_eq!(rx.await.unwrap(), Ok("12345".to_owned()));
    }

    #[tokio::test]
    async fn expire_rejects_with_timeout() {
        let (continuation, rx) = Continuation::new(Step::Phone, 2, Duration::from_secs(5));
        continuation.expire();
        assert_eq!(rx.await.unwrap(), Err(LoginError::StepTimeout));
    }

    #[tokio::test]
    async fn resume_after_hook_left_reports_failure() {
        let (continuation, rx) = Continuation::new(Step::Password, 3, Duration::from_secs(5));
        drop(rx);
        assert!(!continuation.resume("secret".into()));
    }
}
