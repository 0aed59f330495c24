use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{Participant, Session};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QrError {
    #[error("QR code is not a check-in code")]
    Malformed,

    #[error("QR code was not issued by this program")]
    UnknownToken,

    #[error("QR code belongs to a different session")]
    WrongSession,

    #[error("QR code expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("session has already ended")]
    SessionClosed,

    #[error("{0} is not enrolled in this session's program")]
    NotEnrolled(String),
}

/// The string encoded into the QR image: `<session id>.<token>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QrPayload {
    pub session_id: Uuid,
    pub token: Uuid,
}

impl fmt::Display for QrPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id.simple(), self.token.simple())
    }
}

impl FromStr for QrPayload {
    type Err = QrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, token) = s.trim().split_once('.').ok_or(QrError::Malformed)?;
        Ok(Self {
            session_id: Uuid::parse_str(session).map_err(|_| QrError::Malformed)?,
            token: Uuid::parse_str(token).map_err(|_| QrError::Malformed)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QrTicket {
    pub payload: QrPayload,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Mints a fresh token for an open session.
pub fn issue(session: &Session, ttl: Duration, now: DateTime<Utc>) -> Result<QrTicket, QrError> {
    if !session.is_open(now) {
        return Err(QrError::SessionClosed);
    }

    Ok(QrTicket {
        payload: QrPayload {
            session_id: session.session_id,
            token: Uuid::new_v4(),
        },
        issued_at: now,
        expires_at: now + ttl,
    })
}

/// Decides whether a scanned payload may be redeemed against `session`.
///
/// `issued` is the stored ticket looked up by the payload's token, and
/// `scanner` the participant registered under `email`, if either exists.
pub fn check_redemption(
    issued: Option<&QrTicket>,
    payload: &QrPayload,
    session: &Session,
    scanner: Option<&Participant>,
    email: &str,
    now: DateTime<Utc>,
) -> Result<(), QrError> {
    let ticket = issued
        .filter(|t| t.payload.token == payload.token)
        .ok_or(QrError::UnknownToken)?;

    if ticket.payload.session_id != payload.session_id || payload.session_id != session.session_id
    {
        return Err(QrError::WrongSession);
    }

    if now >= ticket.expires_at {
        return Err(QrError::Expired(ticket.expires_at));
    }

    if !session.is_open(now) {
        return Err(QrError::SessionClosed);
    }

    match scanner {
        Some(p) if p.program_id == session.program_id => Ok(()),
        Some(p) => Err(QrError::NotEnrolled(p.email.clone())),
        None => Err(QrError::NotEnrolled(email.to_string())),
    }
}
