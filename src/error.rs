//! Boundary error taxonomy (§7).
//!
//! The wire never sees an internal exception type: every handler result is
//! either `Ok(impl Serialize)` or `Err(AppError)`, and `AppError` serializes
//! to nothing but one of the enumerated `code`s below. Internal failures
//! (Redis, HTTP, media-engine) are wrapped in [`failure::Error`] deeper in
//! the stack and converted to [`AppError::Internal`] at the handler
//! boundary, where they are logged with a correlation id.

use derive_more::Display;
use failure::Fail;
use serde::Serialize;

/// Enumerated result values for the client request surface.
///
/// Every variant maps to exactly one `code` string from §7. Adding a new
/// failure mode means adding a variant here, never returning a free-form
/// string.
#[derive(Clone, Copy, Debug, Display, Eq, Fail, PartialEq)]
pub enum AppError {
    // Transport-level (handshake). Closes the connection.
    #[display(fmt = "origin not allowed")]
    OriginNotAllowed,
    #[display(fmt = "authentication required")]
    AuthRequired,
    #[display(fmt = "invalid credentials")]
    InvalidCredentials,
    #[display(fmt = "authentication failed")]
    AuthFailed,

    // Request-level.
    #[display(fmt = "payload failed schema validation")]
    InvalidPayload,
    #[display(fmt = "client is not in a room")]
    NotInRoom,
    #[display(fmt = "room not found")]
    RoomNotFound,
    #[display(fmt = "transport not found")]
    TransportNotFound,
    #[display(fmt = "producer not found")]
    ProducerNotFound,
    #[display(fmt = "consumer not found")]
    ConsumerNotFound,
    #[display(fmt = "cannot consume this producer")]
    CannotConsume,
    #[display(fmt = "transport limit reached")]
    TransportLimitReached,

    #[display(fmt = "seat already taken")]
    SeatTaken,
    #[display(fmt = "seat already occupied")]
    SeatOccupied,
    #[display(fmt = "seat is locked")]
    SeatLocked,
    #[display(fmt = "seat is already locked")]
    SeatAlreadyLocked,
    #[display(fmt = "seat is not locked")]
    SeatNotLocked,
    #[display(fmt = "user is not seated")]
    UserNotSeated,
    #[display(fmt = "user is already seated")]
    AlreadySeated,
    #[display(fmt = "seat index out of range")]
    SeatOutOfRange,

    #[display(fmt = "an invite is already pending")]
    InvitePending,
    #[display(fmt = "no invite found")]
    NoInvite,
    #[display(fmt = "failed to create invite")]
    InviteCreateFailed,
    #[display(fmt = "cannot invite self")]
    CannotInviteSelf,

    #[display(fmt = "cannot gift self")]
    CannotGiftSelf,
    #[display(fmt = "rate limited")]
    RateLimited,

    #[display(fmt = "not authorized")]
    NotAuthorized,

    #[display(fmt = "internal error")]
    Internal,
}

impl AppError {
    /// The stable wire code for this error, identical to the `Display`
    /// rendering of the `SCREAMING_SNAKE_CASE` serialization.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::OriginNotAllowed => "ORIGIN_NOT_ALLOWED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AuthFailed => "AUTH_FAILED",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::TransportNotFound => "TRANSPORT_NOT_FOUND",
            Self::ProducerNotFound => "PRODUCER_NOT_FOUND",
            Self::ConsumerNotFound => "CONSUMER_NOT_FOUND",
            Self::CannotConsume => "CANNOT_CONSUME",
            Self::TransportLimitReached => "TRANSPORT_LIMIT_REACHED",
            Self::SeatTaken => "SEAT_TAKEN",
            Self::SeatOccupied => "SEAT_OCCUPIED",
            Self::SeatLocked => "SEAT_LOCKED",
            Self::SeatAlreadyLocked => "SEAT_ALREADY_LOCKED",
            Self::SeatNotLocked => "SEAT_NOT_LOCKED",
            Self::UserNotSeated => "USER_NOT_SEATED",
            Self::AlreadySeated => "ALREADY_SEATED",
            Self::SeatOutOfRange => "SEAT_OUT_OF_RANGE",
            Self::InvitePending => "INVITE_PENDING",
            Self::NoInvite => "NO_INVITE",
            Self::InviteCreateFailed => "INVITE_CREATE_FAILED",
            Self::CannotInviteSelf => "CANNOT_INVITE_SELF",
            Self::CannotGiftSelf => "CANNOT_GIFT_SELF",
            Self::RateLimited => "RATE_LIMITED",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Wraps an unexpected internal failure so it can flow through `?` to a
/// handler boundary, where it is logged with context and downgraded to
/// [`AppError::Internal`].
///
/// Mirrors the teacher's `RoomError`/`PeerError` convention of keeping
/// internal causes out of the wire representation while still preserving
/// them for logs.
#[derive(Debug, Fail)]
#[fail(display = "internal error: {}", _0)]
pub struct InternalError(#[fail(cause)] pub failure::Error);

impl From<InternalError> for AppError {
    fn from(_: InternalError) -> Self {
        Self::Internal
    }
}

impl From<redis::RedisError> for InternalError {
    fn from(e: redis::RedisError) -> Self {
        Self(e.into())
    }
}

impl From<reqwest::Error> for InternalError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.into())
    }
}

impl From<serde_json::Error> for InternalError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.into())
    }
}

/// Response envelope returned for every client request.
///
/// `{success:true, data?}` on the happy path, `{success:false, error:code}`
/// otherwise — never a free-form string.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Ack<T: Serialize> {
    Ok { success: bool, data: T },
    Err { success: bool, error: &'static str },
}

impl<T: Serialize> Ack<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self::Ok {
            success: true,
            data,
        }
    }

    #[must_use]
    pub fn err(e: AppError) -> Self {
        Self::Err {
            success: false,
            error: e.code(),
        }
    }

    /// Builds an [`Ack`] from a handler's [`AppResult`].
    #[must_use]
    pub fn from_result(result: AppResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
