//! The closed event vocabulary of the socket protocol.
//!
//! Inbound frames are parsed in two steps: the envelope first (so rate limiting
//! and abuse accounting work even for malformed payloads), then the typed
//! payload. Outbound frames are one tagged enum serialized as
//! `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::wire::{
    BuffKind, BuffState, FriendEntry, FriendRequestEntry, FriendsView, HitEffect, LobbyPlayer,
    LobbyState, MapKey, MatchResults, PartyInviteInfo, PlayerKey, PlayerKilled, PlayerState,
    ProfileInfo, ProjectileState, RoomPhase, StateUpdate,
};

/// The raw envelope of an inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Token-bucket parameters attached to an event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Events allowed per window.
    pub max: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimit {
    pub const fn per_10s(max: u32) -> Self {
        Self { max, window_ms: 10_000 }
    }

    pub const fn per_1s(max: u32) -> Self {
        Self { max, window_ms: 1_000 }
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNamePayload {
    pub new_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendSearchPayload {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendTargetPayload {
    pub target_profile_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRespondPayload {
    pub request_id: String,
    pub accept: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyRespondPayload {
    pub invite_id: String,
    pub accept: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PingPayload {
    pub t: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardedCompletedPayload {
    #[serde(rename = "type")]
    pub reward_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
    #[serde(default)]
    pub player_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_code: String,
    #[serde(default)]
    pub player_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PlayerInputPayload {
    #[serde(default)]
    pub w: bool,
    #[serde(default)]
    pub a: bool,
    #[serde(default)]
    pub s: bool,
    #[serde(default)]
    pub d: bool,
    pub angle: f64,
    #[serde(default)]
    pub charging: bool,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FirePayload {
    pub angle: f64,
    /// Optional client-reported muzzle origin, validated against the
    /// server-side offset when present.
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCodePayload {
    #[serde(default)]
    pub room_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPayload {
    #[serde(default)]
    pub player_key: Option<PlayerKey>,
    /// Legacy alias some clients still send.
    #[serde(default)]
    pub player_id: Option<PlayerKey>,
}

impl KickPayload {
    pub fn target(&self) -> Option<PlayerKey> {
        self.player_key.or(self.player_id)
    }
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Everything a client may send.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    RegisterPlayer(RegisterPayload),
    UpdateName(UpdateNamePayload),
    FriendsGetList,
    FriendsSearch(FriendSearchPayload),
    FriendsSendRequest(FriendTargetPayload),
    FriendsRespondRequest(FriendRespondPayload),
    PartyInviteFriend(FriendTargetPayload),
    PartyInviteRespond(PartyRespondPayload),
    Pong,
    ClientPing(PingPayload),
    AdsGetState,
    AdsRewardedCompleted(RewardedCompletedPayload),
    CreateRoom(CreateRoomPayload),
    JoinRoom(JoinRoomPayload),
    PlayerReady,
    ToggleReady,
    StartGame,
    PlayerInput(PlayerInputPayload),
    FireProjectile(FirePayload),
    LeaveRoom,
    RequestLobbyState(RoomCodePayload),
    ReturnToLobby(RoomCodePayload),
    AckMatchResults,
    KickPlayer(KickPayload),
}

/// Why an envelope did not become a [`ClientEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventParseError {
    UnknownEvent,
    BadPayload,
}

fn payload<T: serde::de::DeserializeOwned>(data: Option<&Value>) -> Result<T, EventParseError> {
    let value = data.cloned().unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|_| EventParseError::BadPayload)
}

impl ClientEvent {
    /// Parses the typed event out of an envelope. Unit events tolerate a
    /// missing or null `data` field; payload events tolerate absent optional
    /// fields only.
    pub fn parse(event: &str, data: Option<&Value>) -> Result<ClientEvent, EventParseError> {
        Ok(match event {
            "registerPlayer" => Self::RegisterPlayer(payload(data)?),
            "updateName" => Self::UpdateName(payload(data)?),
            "friends:getList" => Self::FriendsGetList,
            "friends:search" => Self::FriendsSearch(payload(data)?),
            "friends:sendRequest" => Self::FriendsSendRequest(payload(data)?),
            "friends:respondRequest" => Self::FriendsRespondRequest(payload(data)?),
            "party:inviteFriend" => Self::PartyInviteFriend(payload(data)?),
            "party:inviteRespond" => Self::PartyInviteRespond(payload(data)?),
            "pong" => Self::Pong,
            "clientPing" => Self::ClientPing(payload(data)?),
            "ads:getState" => Self::AdsGetState,
            "ads:rewardedCompleted" => Self::AdsRewardedCompleted(payload(data)?),
            "createRoom" => Self::CreateRoom(payload(data)?),
            "joinRoom" => Self::JoinRoom(payload(data)?),
            "playerReady" => Self::PlayerReady,
            "toggleReady" => Self::ToggleReady,
            "startGame" => Self::StartGame,
            "playerInput" => Self::PlayerInput(payload(data)?),
            "fireProjectile" => Self::FireProjectile(payload(data)?),
            "leaveRoom" => Self::LeaveRoom,
            "requestLobbyState" => Self::RequestLobbyState(payload(data)?),
            "returnToLobby" => Self::ReturnToLobby(payload(data)?),
            "ackMatchResults" => Self::AckMatchResults,
            "kickPlayer" => Self::KickPlayer(payload(data)?),
            _ => return Err(EventParseError::UnknownEvent),
        })
    }

    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterPlayer(_) => "registerPlayer",
            Self::UpdateName(_) => "updateName",
            Self::FriendsGetList => "friends:getList",
            Self::FriendsSearch(_) => "friends:search",
            Self::FriendsSendRequest(_) => "friends:sendRequest",
            Self::FriendsRespondRequest(_) => "friends:respondRequest",
            Self::PartyInviteFriend(_) => "party:inviteFriend",
            Self::PartyInviteRespond(_) => "party:inviteRespond",
            Self::Pong => "pong",
            Self::ClientPing(_) => "clientPing",
            Self::AdsGetState => "ads:getState",
            Self::AdsRewardedCompleted(_) => "ads:rewardedCompleted",
            Self::CreateRoom(_) => "createRoom",
            Self::JoinRoom(_) => "joinRoom",
            Self::PlayerReady => "playerReady",
            Self::ToggleReady => "toggleReady",
            Self::StartGame => "startGame",
            Self::PlayerInput(_) => "playerInput",
            Self::FireProjectile(_) => "fireProjectile",
            Self::LeaveRoom => "leaveRoom",
            Self::RequestLobbyState(_) => "requestLobbyState",
            Self::ReturnToLobby(_) => "returnToLobby",
            Self::AckMatchResults => "ackMatchResults",
            Self::KickPlayer(_) => "kickPlayer",
        }
    }

    /// Token-bucket parameters by wire name. Unlisted names are not limited
    /// (they are unknown events and get dropped anyway).
    pub fn rate_limit(event: &str) -> Option<RateLimit> {
        Some(match event {
            "registerPlayer" => RateLimit::per_10s(12),
            "updateName" => RateLimit::per_10s(6),
            "friends:getList" => RateLimit::per_10s(30),
            "friends:search" => RateLimit::per_10s(12),
            "friends:sendRequest" => RateLimit::per_10s(12),
            "friends:respondRequest" => RateLimit::per_10s(18),
            "party:inviteFriend" => RateLimit::per_10s(12),
            "party:inviteRespond" => RateLimit::per_10s(18),
            "clientPing" => RateLimit::per_10s(30),
            "ads:getState" => RateLimit::per_10s(12),
            "ads:rewardedCompleted" => RateLimit::per_10s(12),
            "createRoom" => RateLimit::per_10s(4),
            "joinRoom" => RateLimit::per_10s(6),
            "playerReady" | "toggleReady" => RateLimit::per_10s(20),
            "startGame" => RateLimit::per_10s(8),
            "playerInput" => RateLimit::per_1s(90),
            "fireProjectile" => RateLimit::per_1s(18),
            "leaveRoom" => RateLimit::per_10s(12),
            "requestLobbyState" | "returnToLobby" => RateLimit::per_10s(20),
            "ackMatchResults" => RateLimit::per_10s(10),
            "kickPlayer" => RateLimit::per_10s(8),
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIssued {
    pub token: String,
    pub expires_at: u64,
    pub profile: ProfileInfo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub t: u64,
    pub server_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub room_code: String,
    pub player_key: PlayerKey,
    pub lobby: LobbyState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchAnnounce {
    pub map: MapKey,
    pub countdown_ms: u64,
    pub starts_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStarted {
    pub map: MapKey,
    pub match_start: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectedToGame {
    pub room_code: String,
    pub map: MapKey,
    pub phase: RoomPhase,
    pub match_start: u64,
    pub player_key: PlayerKey,
    pub players: Vec<PlayerState>,
    pub buffs: Vec<BuffState>,
}

/// Escalation levels of the abuse engine, as shown to the offender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AbuseAction {
    Warn,
    SoftBlock,
    HardBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiCheatNotice {
    pub action: AbuseAction,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdsState {
    pub instant_respawn_pending: bool,
    pub updated_at: u64,
}

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

/// Everything the server may send. Serialized as the standard envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "sessionToken")]
    SessionToken(SessionIssued),
    #[serde(rename = "heartbeat")]
    Heartbeat { t: u64 },
    #[serde(rename = "clientPong")]
    ClientPong(ServerTime),
    #[serde(rename = "serverPong")]
    ServerPong(ServerTime),
    #[serde(rename = "roomCreated")]
    RoomCreated(RoomCreated),
    #[serde(rename = "playerJoined")]
    PlayerJoined { room_code: String, player: LobbyPlayer },
    #[serde(rename = "playerLeft")]
    PlayerLeft { player_key: PlayerKey, name: String },
    #[serde(rename = "lobbyUpdate")]
    LobbyUpdate(LobbyState),
    #[serde(rename = "party:lobbyState")]
    PartyLobbyState(LobbyState),
    #[serde(rename = "lobbySnapshot")]
    LobbySnapshot(LobbyState),
    #[serde(rename = "updatePlayers")]
    UpdatePlayers { players: Vec<LobbyPlayer> },
    #[serde(rename = "playerReadyUpdate")]
    PlayerReadyUpdate { player_key: PlayerKey, ready: bool },
    #[serde(rename = "newLeader")]
    NewLeader { player_key: PlayerKey, name: String },
    #[serde(rename = "gameStarting")]
    GameStarting(MatchAnnounce),
    #[serde(rename = "countdownStart")]
    CountdownStart(MatchAnnounce),
    #[serde(rename = "gameStarted")]
    GameStarted(MatchStarted),
    #[serde(rename = "gameStart")]
    GameStart(MatchStarted),
    #[serde(rename = "stateUpdate")]
    StateUpdate(StateUpdate),
    #[serde(rename = "projectileFired")]
    ProjectileFired(ProjectileState),
    #[serde(rename = "hitEffect")]
    HitEffect(HitEffect),
    #[serde(rename = "shieldBreak")]
    ShieldBreak { player_key: PlayerKey },
    #[serde(rename = "playerKilled")]
    PlayerKilled(PlayerKilled),
    #[serde(rename = "playerRespawn")]
    PlayerRespawn { player: PlayerState },
    #[serde(rename = "buffPickup")]
    BuffPickup { buff_id: u8, player_key: PlayerKey, kind: BuffKind },
    #[serde(rename = "buffRespawn")]
    BuffRespawn { buff: BuffState },
    #[serde(rename = "instantRespawnUsed")]
    InstantRespawnUsed { player_key: PlayerKey, remaining: u32 },
    #[serde(rename = "gameEnd")]
    GameEnd(MatchResults),
    #[serde(rename = "matchResultsPending")]
    MatchResultsPending(MatchResults),
    #[serde(rename = "kickedFromParty")]
    KickedFromParty { room_code: String },
    #[serde(rename = "reconnectedToGame")]
    ReconnectedToGame(ReconnectedToGame),
    #[serde(rename = "reconnectLimited")]
    ReconnectLimited { retry_after_ms: u64 },
    #[serde(rename = "antiCheatAction")]
    AntiCheatAction(AntiCheatNotice),
    #[serde(rename = "authError")]
    AuthError(ErrorNotice),
    #[serde(rename = "joinError")]
    JoinError(ErrorNotice),
    #[serde(rename = "error")]
    Error(ErrorNotice),
    #[serde(rename = "friends:listUpdated")]
    FriendsListUpdated(FriendsView),
    #[serde(rename = "friends:incomingRequest")]
    FriendsIncomingRequest(FriendRequestEntry),
    #[serde(rename = "friends:requestSent")]
    FriendsRequestSent(FriendRequestEntry),
    #[serde(rename = "friends:requestResponded")]
    FriendsRequestResponded {
        request_id: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        friend: Option<FriendEntry>,
    },
    #[serde(rename = "friends:searchResult")]
    FriendsSearchResult { results: Vec<FriendEntry> },
    #[serde(rename = "friends:error")]
    FriendsError(ErrorNotice),
    #[serde(rename = "party:inviteSent")]
    PartyInviteSent(PartyInviteInfo),
    #[serde(rename = "party:inviteReceived")]
    PartyInviteReceived(PartyInviteInfo),
    #[serde(rename = "party:inviteResponded")]
    PartyInviteResponded { invite_id: String, accepted: bool, by_profile_id: String },
    #[serde(rename = "party:inviteExpired")]
    PartyInviteExpired { invite_id: String },
    #[serde(rename = "party:inviteError")]
    PartyInviteError(ErrorNotice),
    #[serde(rename = "ads:state")]
    AdsStateEvent(AdsState),
    #[serde(rename = "profile:nicknameUpdated")]
    NicknameUpdated { profile_id: String, nickname: String },
}
