//! SMTP greeting/HELO/QUIT state machine.
//!
//! The dialogue is modelled as a pure transition function so it can be
//! driven by any transport:
//! - Start → HaveBanner (wait for the greeting)
//! - HaveBanner → SentHelo (greeting is 220, send HELO)
//! - SentHelo → RecvHelo (wait for the HELO reply)
//! - RecvHelo → SentQuit (reply is 250, send QUIT)
//! - SentQuit → RecvQuit (wait for the QUIT reply)
//! - RecvQuit → success

use crate::error::ProbeFailure;
use crate::transport::LineTransport;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Status code a server greeting must carry
pub const STATUS_SERVICE_READY: u16 = 220;

/// Status code a HELO reply must carry
pub const STATUS_OK: u16 = 250;

/// Position in the SMTP dialogue. Every connection starts at `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolState {
    Start,
    HaveBanner,
    SentHelo,
    RecvHelo,
    SentQuit,
    RecvQuit,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Start => write!(f, "START"),
            ProtocolState::HaveBanner => write!(f, "HAVE_BANNER"),
            ProtocolState::SentHelo => write!(f, "SENT_HELO"),
            ProtocolState::RecvHelo => write!(f, "RECV_HELO"),
            ProtocolState::SentQuit => write!(f, "SENT_QUIT"),
            ProtocolState::RecvQuit => write!(f, "RECV_QUIT"),
        }
    }
}

/// Completion delivered to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// The connector established the connection
    Connected,
    /// A full line was received
    LineReceived(&'a [u8]),
    /// The pending line was written
    LineSent,
}

/// Next thing the driver must do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ReceiveLine,
    SendLine(String),
    Succeed,
    Fail(ProtocolFailure),
}

/// Dialogue-level failure, before a target is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFailure {
    BadGreeting(Option<u16>),
    BadHeloResponse(Option<u16>),
    UnknownState(ProtocolState),
}

/// Parse the leading status code of a reply line.
///
/// Exactly three ASCII digits are required, followed by a space, CR, LF or
/// the end of the data. Continuation lines (`220-`) and anything else are
/// rejected.
pub fn parse_status(line: &[u8]) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    match line.get(3) {
        None | Some(b' ' | b'\r' | b'\n') => {}
        Some(_) => return None,
    }

    Some(
        digits
            .iter()
            .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')),
    )
}

/// Advance the dialogue by one completion.
pub fn transition(state: ProtocolState, event: Event<'_>, helo_name: &str) -> (ProtocolState, Action) {
    match (state, event) {
        (ProtocolState::Start, Event::Connected) => (ProtocolState::HaveBanner, Action::ReceiveLine),

        (ProtocolState::HaveBanner, Event::LineReceived(line)) => match parse_status(line) {
            Some(STATUS_SERVICE_READY) => (
                ProtocolState::SentHelo,
                Action::SendLine(format!("HELO {}\r\n", helo_name)),
            ),
            status => (state, Action::Fail(ProtocolFailure::BadGreeting(status))),
        },

        (ProtocolState::SentHelo, Event::LineSent) => (ProtocolState::RecvHelo, Action::ReceiveLine),

        (ProtocolState::RecvHelo, Event::LineReceived(line)) => match parse_status(line) {
            Some(STATUS_OK) => (ProtocolState::SentQuit, Action::SendLine("QUIT\r\n".to_string())),
            status => (state, Action::Fail(ProtocolFailure::BadHeloResponse(status))),
        },

        (ProtocolState::SentQuit, Event::LineSent) => (ProtocolState::RecvQuit, Action::ReceiveLine),

        (ProtocolState::RecvQuit, Event::LineReceived(_)) => (state, Action::Succeed),

        _ => (state, Action::Fail(ProtocolFailure::UnknownState(state))),
    }
}

/// Run the whole dialogue over a connected transport.
pub async fn run_dialogue<S>(transport: &mut LineTransport<S>, helo_name: &str) -> Result<(), ProbeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = transport.target();
    let (mut state, mut action) = transition(ProtocolState::Start, Event::Connected, helo_name);

    loop {
        (state, action) = match action {
            Action::ReceiveLine => {
                let line = transport.receive_line().await?;
                transition(state, Event::LineReceived(&line[..]), helo_name)
            }
            Action::SendLine(line) => {
                transport.send_line(&line).await?;
                transition(state, Event::LineSent, helo_name)
            }
            Action::Succeed => return Ok(()),
            Action::Fail(failure) => {
                return Err(match failure {
                    ProtocolFailure::BadGreeting(status) => ProbeFailure::BadGreeting { target, status },
                    ProtocolFailure::BadHeloResponse(status) => {
                        ProbeFailure::BadHeloResponse { target, status }
                    }
                    ProtocolFailure::UnknownState(state) => ProbeFailure::UnknownState { target, state },
                });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::types::Target;
    use std::time::Duration;
    use tokio_test::io::Builder;

    const HELO: &str = "lb.example.com";

    #[test]
    fn test_parse_status_valid() {
        assert_eq!(parse_status(b"220 x.com\r\n"), Some(220));
        assert_eq!(parse_status(b"250\r\n"), Some(250));
        assert_eq!(parse_status(b"221"), Some(221));
    }

    #[test]
    fn test_parse_status_rejects_continuation() {
        assert_eq!(parse_status(b"220-x.com\r\n"), None);
    }

    #[test]
    fn test_parse_status_rejects_wrong_digit_count() {
        assert_eq!(parse_status(b"22 ok"), None);
        assert_eq!(parse_status(b"2200 ok"), None);
        assert_eq!(parse_status(b"22"), None);
    }

    #[test]
    fn test_parse_status_rejects_non_digits() {
        assert_eq!(parse_status(b"abc"), None);
        assert_eq!(parse_status(b" 220 x"), None);
        assert_eq!(parse_status(b"+22 x"), None);
        assert_eq!(parse_status(b""), None);
    }

    #[test]
    fn test_happy_path_transitions() {
        let (state, action) = transition(ProtocolState::Start, Event::Connected, HELO);
        assert_eq!((state, &action), (ProtocolState::HaveBanner, &Action::ReceiveLine));

        let (state, action) = transition(state, Event::LineReceived(b"220 mx ESMTP\r\n"), HELO);
        assert_eq!(state, ProtocolState::SentHelo);
        assert_eq!(action, Action::SendLine("HELO lb.example.com\r\n".to_string()));

        let (state, action) = transition(state, Event::LineSent, HELO);
        assert_eq!((state, &action), (ProtocolState::RecvHelo, &Action::ReceiveLine));

        let (state, action) = transition(state, Event::LineReceived(b"250 Hello\r\n"), HELO);
        assert_eq!(state, ProtocolState::SentQuit);
        assert_eq!(action, Action::SendLine("QUIT\r\n".to_string()));

        let (state, action) = transition(state, Event::LineSent, HELO);
        assert_eq!((state, &action), (ProtocolState::RecvQuit, &Action::ReceiveLine));

        let (_, action) = transition(state, Event::LineReceived(b"221 Bye\r\n"), HELO);
        assert_eq!(action, Action::Succeed);
    }

    #[test]
    fn test_bad_banner_fails() {
        let (_, action) = transition(
            ProtocolState::HaveBanner,
            Event::LineReceived(b"421 Service not available\r\n"),
            HELO,
        );
        assert_eq!(action, Action::Fail(ProtocolFailure::BadGreeting(Some(421))));

        let (_, action) = transition(ProtocolState::HaveBanner, Event::LineReceived(b"220-wait\r\n"), HELO);
        assert_eq!(action, Action::Fail(ProtocolFailure::BadGreeting(None)));
    }

    #[test]
    fn test_bad_helo_reply_fails() {
        let (_, action) = transition(
            ProtocolState::RecvHelo,
            Event::LineReceived(b"501 Syntax error\r\n"),
            HELO,
        );
        assert_eq!(action, Action::Fail(ProtocolFailure::BadHeloResponse(Some(501))));
    }

    #[test]
    fn test_unexpected_event_is_unknown_state() {
        let (_, action) = transition(ProtocolState::HaveBanner, Event::LineSent, HELO);
        assert_eq!(
            action,
            Action::Fail(ProtocolFailure::UnknownState(ProtocolState::HaveBanner))
        );
    }

    fn target() -> Target {
        Target("10.0.0.1:25".parse().unwrap())
    }

    #[tokio::test]
    async fn test_dialogue_success() {
        let mock = Builder::new()
            .read(b"220 mail.example.com ESMTP\r\n")
            .write(b"HELO lb.example.com\r\n")
            .read(b"250 Hello\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 Bye\r\n")
            .build();
        let mut transport = LineTransport::new(mock, target(), Duration::from_secs(5));

        run_dialogue(&mut transport, HELO).await.unwrap();
    }

    #[tokio::test]
    async fn test_dialogue_bad_greeting() {
        let mock = Builder::new().read(b"421 Service not available\r\n").build();
        let mut transport = LineTransport::new(mock, target(), Duration::from_secs(5));

        let err = run_dialogue(&mut transport, HELO).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::BadGreeting);
        assert!(matches!(err, ProbeFailure::BadGreeting { status: Some(421), .. }));
    }

    #[tokio::test]
    async fn test_dialogue_rejects_tail_of_overlong_banner() {
        let long = vec![b'x'; crate::transport::LINE_BUFFER_CAPACITY];
        let mock = Builder::new().read(&long).read(b"220 ok\r\n").build();
        let mut transport = LineTransport::new(mock, target(), Duration::from_secs(5));

        let err = run_dialogue(&mut transport, HELO).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ReadFailure);
    }

    #[tokio::test]
    async fn test_dialogue_bad_helo_reply() {
        let mock = Builder::new()
            .read(b"220 mail.example.com\r\n")
            .write(b"HELO lb.example.com\r\n")
            .read(b"550 go away\r\n")
            .build();
        let mut transport = LineTransport::new(mock, target(), Duration::from_secs(5));

        let err = run_dialogue(&mut transport, HELO).await.unwrap_err();
        assert_eq!(err.to_string(), "Bad HELO response from server [10.0.0.1]:25");
    }

    #[tokio::test]
    async fn test_dialogue_quit_reply_not_inspected() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"HELO lb.example.com\r\n")
            .read(b"250 ok\r\n")
            .write(b"QUIT\r\n")
            .read(b"500 whatever\r\n")
            .build();
        let mut transport = LineTransport::new(mock, target(), Duration::from_secs(5));

        assert!(run_dialogue(&mut transport, HELO).await.is_ok());
    }
}
