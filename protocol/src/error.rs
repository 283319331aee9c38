//! Stable error codes surfaced to clients.
//!
//! The wire carries the string form; the enum exists so the server never
//! dispatches on raw strings internally.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Every failure a handler can surface to the originating client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Auth
    AuthRequired,
    AuthContextRequired,
    InvalidCredentials,
    EmailNotVerified,
    AccountSuspended,
    // Lobby / match
    RoomNotFound,
    RoomFull,
    GameAlreadyStarted,
    NotLeader,
    NotAllReady,
    InvalidKickTarget,
    ActiveMatchLock,
    // Party / friends
    ProfileNotFound,
    FriendRequestAlreadyExists,
    AlreadyFriends,
    FriendRequestNotFound,
    PartyInviteNotAllowed,
    PartyInviteExpired,
    TargetNotOnline,
    TargetAlreadyInParty,
    // Rate / abuse
    RateLimited,
    ReconnectLimited,
    // Rewards
    InMatch,
    NotAllowedWhileReady,
    InvalidRewardType,
}

impl ErrorCode {
    /// The inverse of [`ErrorCode::as_str`].
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "AUTH_REQUIRED" => Some(Self::AuthRequired),
            "AUTH_CONTEXT_REQUIRED" => Some(Self::AuthContextRequired),
            "INVALID_CREDENTIALS" => Some(Self::InvalidCredentials),
            "EMAIL_NOT_VERIFIED" => Some(Self::EmailNotVerified),
            "ACCOUNT_SUSPENDED" => Some(Self::AccountSuspended),
            "ROOM_NOT_FOUND" => Some(Self::RoomNotFound),
            "ROOM_FULL" => Some(Self::RoomFull),
            "GAME_ALREADY_STARTED" => Some(Self::GameAlreadyStarted),
            "NOT_LEADER" => Some(Self::NotLeader),
            "NOT_ALL_READY" => Some(Self::NotAllReady),
            "INVALID_KICK_TARGET" => Some(Self::InvalidKickTarget),
            "ACTIVE_MATCH_LOCK" => Some(Self::ActiveMatchLock),
            "PROFILE_NOT_FOUND" => Some(Self::ProfileNotFound),
            "FRIEND_REQUEST_ALREADY_EXISTS" => Some(Self::FriendRequestAlreadyExists),
            "ALREADY_FRIENDS" => Some(Self::AlreadyFriends),
            "FRIEND_REQUEST_NOT_FOUND" => Some(Self::FriendRequestNotFound),
            "PARTY_INVITE_NOT_ALLOWED" => Some(Self::PartyInviteNotAllowed),
            "PARTY_INVITE_EXPIRED" => Some(Self::PartyInviteExpired),
            "TARGET_NOT_ONLINE" => Some(Self::TargetNotOnline),
            "TARGET_ALREADY_IN_PARTY" => Some(Self::TargetAlreadyInParty),
            "RATE_LIMITED" => Some(Self::RateLimited),
            "RECONNECT_LIMITED" => Some(Self::ReconnectLimited),
            "IN_MATCH" => Some(Self::InMatch),
            "NOT_ALLOWED_WHILE_READY" => Some(Self::NotAllowedWhileReady),
            "INVALID_REWARD_TYPE" => Some(Self::InvalidRewardType),
            _ => None,
        }
    }

    /// The stable wire spelling. Never change an existing value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthContextRequired => "AUTH_CONTEXT_REQUIRED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            Self::AccountSuspended => "ACCOUNT_SUSPENDED",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::RoomFull => "ROOM_FULL",
            Self::GameAlreadyStarted => "GAME_ALREADY_STARTED",
            Self::NotLeader => "NOT_LEADER",
            Self::NotAllReady => "NOT_ALL_READY",
            Self::InvalidKickTarget => "INVALID_KICK_TARGET",
            Self::ActiveMatchLock => "ACTIVE_MATCH_LOCK",
            Self::ProfileNotFound => "PROFILE_NOT_FOUND",
            Self::FriendRequestAlreadyExists => "FRIEND_REQUEST_ALREADY_EXISTS",
            Self::AlreadyFriends => "ALREADY_FRIENDS",
            Self::FriendRequestNotFound => "FRIEND_REQUEST_NOT_FOUND",
            Self::PartyInviteNotAllowed => "PARTY_INVITE_NOT_ALLOWED",
            Self::PartyInviteExpired => "PARTY_INVITE_EXPIRED",
            Self::TargetNotOnline => "TARGET_NOT_ONLINE",
            Self::TargetAlreadyInParty => "TARGET_ALREADY_IN_PARTY",
            Self::RateLimited => "RATE_LIMITED",
            Self::ReconnectLimited => "RECONNECT_LIMITED",
            Self::InMatch => "IN_MATCH",
            Self::NotAllowedWhileReady => "NOT_ALLOWED_WHILE_READY",
            Self::InvalidRewardType => "INVALID_REWARD_TYPE",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ErrorCode::from_str_opt(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code: {s}")))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_spelling_is_screaming_snake() {
        for code in [
            ErrorCode::RoomNotFound,
            ErrorCode::NotAllowedWhileReady,
            ErrorCode::FriendRequestAlreadyExists,
        ] {
            let s = code.as_str();
            assert!(s.chars().all(|c| c.is_ascii_uppercase() || c == '_'), "{s}");
        }
    }

    #[test]
    fn serializes_as_bare_string() {
        let json = serde_json::to_string(&ErrorCode::RoomFull).unwrap();
        assert_eq!(json, "\"ROOM_FULL\"");
    }
}
