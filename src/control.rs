//! Tagged request/response control surface over the queue.
//!
//! Each caller opens a [`Session`], the in-process analogue of an open device
//! handle: it carries one consumer identity and its claim slot.

use std::sync::Arc;

use log::debug;

use crate::consumer::Consumer;
use crate::error::QueueResult;
use crate::queue::CommandQueue;
use crate::types::{Claim, CommandKind, ConsumerId, StatusRecord};

/// One operation with exactly the payload it needs.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Raw command code from an untyped caller; blocks until retired.
    Submit { code: i32 },
    Take,
    Finish { claim: Claim },
    WriteStatus(StatusRecord),
    ReadStatus,
}

impl Request {
    pub fn submit(kind: CommandKind) -> Self {
        Request::Submit { code: kind.code() }
    }

    /// Operation name used in logs.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Submit { .. } => "submit",
            Request::Take => "take",
            Request::Finish { .. } => "finish",
            Request::WriteStatus(_) => "write-status",
            Request::ReadStatus => "read-status",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The submitted command was retired.
    Retired,
    Claimed(Claim),
    /// The claim was finished and its producer released.
    Finished,
    StatusWritten,
    Status(StatusRecord),
}

/// Per-caller handle onto a shared [`CommandQueue`].
pub struct Session {
    consumer: Consumer,
}

impl Session {
    pub fn id(&self) -> ConsumerId {
        self.consumer.id()
    }

    /// Dispatch one request.
    pub fn call(&self, request: Request) -> QueueResult<Response> {
        let queue = self.consumer.queue();
        debug!("session {}: {}", self.consumer.id(), request.operation());
        match request {
            Request::Submit { code } => queue.submit_code(code).map(|()| Response::Retired),
            Request::Take => self.consumer.take().map(Response::Claimed),
            Request::Finish { claim } => self.consumer.finish(&claim).map(|()| Response::Finished),
            Request::WriteStatus(record) => {
                queue.write_status(record).map(|()| Response::StatusWritten)
            }
            Request::ReadStatus => queue.read_status().map(Response::Status),
        }
    }
}

impl CommandQueue {
    /// Open a control session with its own consumer identity.
    pub fn open(self: &Arc<Self>) -> Session {
        Session {
            consumer: self.open_consumer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sessions_drive_the_full_round_trip() {
        let queue = Arc::new(CommandQueue::new());
        let worker = queue.open();
        let (done_tx, done_rx) = mpsc::channel();

        let control_queue = Arc::clone(&queue);
        let control = thread::spawn(move || {
            let session = control_queue.open();
            let response = session
                .call(Request::submit(CommandKind::BoostEnable))
                .expect("submit");
            done_tx.send(response).expect("send");
        });

        let claim = loop {
            match worker.call(Request::Take) {
                Ok(Response::Claimed(claim)) => break claim,
                Err(QueueError::Empty) => thread::sleep(Duration::from_millis(1)),
                other => panic!("unexpected take result {other:?}"),
            }
        };
        assert_eq!(claim.kind(), CommandKind::BoostEnable);
        assert_eq!(claim.consumer(), worker.id());
        assert_eq!(
            worker.call(Request::Finish { claim }),
            Ok(Response::Finished)
        );
        let response = done_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("control released");
        assert_eq!(response, Response::Retired);
        control.join().expect("control thread panicked");
    }

    #[test]
    fn invalid_submit_code_fails_fast() {
        let queue = Arc::new(CommandQueue::new());
        let session = queue.open();
        assert_eq!(
            session.call(Request::Submit { code: 9 }),
            Err(QueueError::InvalidKind(9))
        );
        assert_eq!(queue.len(), Ok(0));
    }

    #[test]
    fn finish_through_another_session_is_rejected() {
        let queue = Arc::new(CommandQueue::new());
        let _pending = queue.enqueue(CommandKind::Ping).expect("enqueue");
        let owner = queue.open();
        let other = queue.open();
        let Ok(Response::Claimed(claim)) = owner.call(Request::Take) else {
            panic!("take failed");
        };
        assert_eq!(
            other.call(Request::Finish { claim }),
            Err(QueueError::NoActiveClaim {
                consumer: other.id()
            })
        );
        assert_eq!(owner.call(Request::Finish { claim }), Ok(Response::Finished));
    }

    #[test]
    fn status_round_trips_through_sessions() {
        let queue = Arc::new(CommandQueue::new());
        let writer = queue.open();
        let reader = queue.open();
        assert_eq!(
            reader.call(Request::ReadStatus),
            Err(QueueError::Uninitialized)
        );

        let mut record = StatusRecord::named("mesarthim");
        record.boost = true;
        record.telemetry.altitude = 408_000;
        assert_eq!(
            writer.call(Request::WriteStatus(record.clone())),
            Ok(Response::StatusWritten)
        );
        assert_eq!(reader.call(Request::ReadStatus), Ok(Response::Status(record)));
    }

    #[test]
    fn operation_names_are_stable() {
        assert_eq!(Request::Take.operation(), "take");
        assert_eq!(Request::submit(CommandKind::Ping).operation(), "submit");
        assert_eq!(Request::ReadStatus.operation(), "read-status");
    }
}
