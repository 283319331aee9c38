//! The identity-store boundary.
//!
//! The core only ever talks to [`IdentityStore`]; profiles, linked accounts
//! and the friend graph live behind it. The in-memory implementation below is
//! the default and the reference for the semantics; a relational store must
//! be drop-in compatible. Calls happen on the socket-event path only, never
//! inside the tick.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use protocol::wire::{FriendRequestEntry, ProfileInfo};
use rand::Rng;
use thiserror::Error;

/// Typed failures of the identity boundary. The wire spelling is stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("PROFILE_NOT_FOUND")]
    ProfileNotFound,
    #[error("EMAIL_ALREADY_USED")]
    EmailAlreadyUsed,
    #[error("USERNAME_TAKEN")]
    UsernameTaken,
    #[error("PROFILE_ALREADY_LINKED")]
    ProfileAlreadyLinked,
    #[error("VERIFICATION_RATE_LIMITED")]
    VerificationRateLimited { retry_after_ms: u64 },
    #[error("INVALID_VERIFICATION_CODE")]
    InvalidVerificationCode,
    #[error("VERIFICATION_CODE_EXPIRED")]
    VerificationCodeExpired,
    #[error("FRIEND_REQUEST_ALREADY_EXISTS")]
    FriendRequestAlreadyExists,
    #[error("ALREADY_FRIENDS")]
    AlreadyFriends,
    #[error("FRIEND_REQUEST_NOT_FOUND")]
    FriendRequestNotFound,
}

/// A newly created pending linked account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAccount {
    pub account_id: String,
    pub verification_code: String,
    pub expires_at_ms: u64,
}

/// A row of the account table, for login flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRow {
    pub account_id: String,
    pub profile_id: String,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub email_verified: bool,
}

/// The friend graph as the store knows it; presence is layered on top by the
/// caller.
#[derive(Debug, Clone, Default)]
pub struct FriendsState {
    pub friends: Vec<ProfileInfo>,
    pub incoming: Vec<FriendRequestEntry>,
    pub outgoing: Vec<FriendRequestEntry>,
}

/// Result of answering a friend request.
#[derive(Debug, Clone)]
pub struct RespondOutcome {
    pub request_id: String,
    pub accepted: bool,
    pub other_profile: ProfileInfo,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Returns the device's active profile, creating a guest one on first
    /// contact.
    async fn ensure_guest_profile(
        &self,
        persistent_id: &str,
        nickname: &str,
    ) -> Result<ProfileInfo, IdentityError>;

    /// Binds the device to an existing profile.
    async fn set_active_profile_for_device(
        &self,
        persistent_id: &str,
        profile_id: &str,
    ) -> Result<ProfileInfo, IdentityError>;

    /// Detaches the device from a linked profile, back onto a guest one.
    async fn switch_to_guest_profile_for_device(
        &self,
        persistent_id: &str,
        fallback_nickname: &str,
    ) -> Result<ProfileInfo, IdentityError>;

    async fn get_profile_snapshot_by_id(&self, profile_id: &str) -> Option<ProfileInfo>;

    /// Renames a profile; the caller broadcasts the change.
    async fn set_nickname(
        &self,
        profile_id: &str,
        nickname: &str,
    ) -> Result<ProfileInfo, IdentityError>;

    async fn create_pending_linked_account(
        &self,
        profile_id: &str,
        email: &str,
        username: &str,
        password_hash: &str,
        code_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<PendingAccount, IdentityError>;

    async fn resend_verification(
        &self,
        email: &str,
        code_ttl_ms: u64,
        cooldown_ms: u64,
        per_hour_cap: u32,
        now_ms: u64,
    ) -> Result<PendingAccount, IdentityError>;

    async fn verify_email_code(
        &self,
        email: &str,
        otp: &str,
        max_attempts: u32,
        now_ms: u64,
    ) -> Result<AccountRow, IdentityError>;

    async fn find_account_by_login(&self, email_or_username: &str) -> Option<AccountRow>;

    async fn get_friends_state(&self, profile_id: &str) -> Result<FriendsState, IdentityError>;

    async fn search_friend_profiles(
        &self,
        profile_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ProfileInfo>, IdentityError>;

    async fn send_friend_request(
        &self,
        from_profile_id: &str,
        to_profile_id: &str,
    ) -> Result<FriendRequestEntry, IdentityError>;

    async fn respond_friend_request(
        &self,
        profile_id: &str,
        request_id: &str,
        accept: bool,
    ) -> Result<RespondOutcome, IdentityError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ProfileRecord {
    info: ProfileInfo,
    linked_account: Option<String>,
}

#[derive(Debug, Clone)]
struct AccountRecord {
    row: AccountRow,
    otp: Option<OtpState>,
    last_sent_ms: u64,
    sends_this_hour: u32,
    hour_start_ms: u64,
}

#[derive(Debug, Clone)]
struct OtpState {
    code: String,
    expires_at_ms: u64,
    attempts: u32,
}

#[derive(Debug, Default)]
struct Inner {
    profiles: HashMap<String, ProfileRecord>,
    device_profiles: HashMap<String, String>,
    /// Guest profile a device falls back to after unlinking.
    device_guests: HashMap<String, String>,
    accounts: HashMap<String, AccountRecord>,
    email_index: HashMap<String, String>,
    username_index: HashMap<String, String>,
    friends: HashMap<String, HashSet<String>>,
    requests: HashMap<String, FriendRequestEntry>,
}

/// The default, process-local identity store.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    inner: Mutex<Inner>,
}

fn short_id(prefix: &str) -> String {
    format!("{prefix}-{:08x}", rand::rng().random::<u32>())
}

fn friend_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

fn verification_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000))
}

impl Inner {
    fn profile(&self, id: &str) -> Result<&ProfileRecord, IdentityError> {
        self.profiles.get(id).ok_or(IdentityError::ProfileNotFound)
    }

    fn are_friends(&self, a: &str, b: &str) -> bool {
        self.friends.get(a).is_some_and(|set| set.contains(b))
    }

    fn open_request_between(&self, a: &str, b: &str) -> bool {
        self.requests.values().any(|r| {
            (r.from_profile_id == a && r.to_profile_id == b)
                || (r.from_profile_id == b && r.to_profile_id == a)
        })
    }

    fn new_guest(&mut self, persistent_id: &str, nickname: &str) -> ProfileInfo {
        let info = ProfileInfo {
            profile_id: short_id("prof"),
            nickname: nickname.to_string(),
            friend_code: friend_code(),
            username: None,
            is_guest: true,
        };
        self.profiles.insert(
            info.profile_id.clone(),
            ProfileRecord { info: info.clone(), linked_account: None },
        );
        self.device_profiles
            .insert(persistent_id.to_string(), info.profile_id.clone());
        self.device_guests
            .insert(persistent_id.to_string(), info.profile_id.clone());
        info
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn ensure_guest_profile(
        &self,
        persistent_id: &str,
        nickname: &str,
    ) -> Result<ProfileInfo, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        if let Some(profile_id) = inner.device_profiles.get(persistent_id).cloned() {
            return Ok(inner.profile(&profile_id)?.info.clone());
        }
        Ok(inner.new_guest(persistent_id, nickname))
    }

    async fn set_active_profile_for_device(
        &self,
        persistent_id: &str,
        profile_id: &str,
    ) -> Result<ProfileInfo, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let info = inner.profile(profile_id)?.info.clone();
        inner
            .device_profiles
            .insert(persistent_id.to_string(), profile_id.to_string());
        Ok(info)
    }

    async fn switch_to_guest_profile_for_device(
        &self,
        persistent_id: &str,
        fallback_nickname: &str,
    ) -> Result<ProfileInfo, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        if let Some(guest_id) = inner.device_guests.get(persistent_id).cloned() {
            if inner.profiles.contains_key(&guest_id) {
                inner
                    .device_profiles
                    .insert(persistent_id.to_string(), guest_id.clone());
                return Ok(inner.profile(&guest_id)?.info.clone());
            }
        }
        Ok(inner.new_guest(persistent_id, fallback_nickname))
    }

    async fn get_profile_snapshot_by_id(&self, profile_id: &str) -> Option<ProfileInfo> {
        let inner = self.inner.lock().expect("identity store poisoned");
        inner.profiles.get(profile_id).map(|p| p.info.clone())
    }

    async fn set_nickname(
        &self,
        profile_id: &str,
        nickname: &str,
    ) -> Result<ProfileInfo, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let record = inner
            .profiles
            .get_mut(profile_id)
            .ok_or(IdentityError::ProfileNotFound)?;
        record.info.nickname = nickname.to_string();
        Ok(record.info.clone())
    }

    async fn create_pending_linked_account(
        &self,
        profile_id: &str,
        email: &str,
        username: &str,
        password_hash: &str,
        code_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<PendingAccount, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let email_key = email.to_ascii_lowercase();
        let username_key = username.to_ascii_lowercase();
        if inner.profile(profile_id)?.linked_account.is_some() {
            return Err(IdentityError::ProfileAlreadyLinked);
        }
        if inner.email_index.contains_key(&email_key) {
            return Err(IdentityError::EmailAlreadyUsed);
        }
        if inner.username_index.contains_key(&username_key) {
            return Err(IdentityError::UsernameTaken);
        }

        let account_id = short_id("acct");
        let code = verification_code();
        let expires_at_ms = now_ms + code_ttl_ms;
        inner.accounts.insert(
            account_id.clone(),
            AccountRecord {
                row: AccountRow {
                    account_id: account_id.clone(),
                    profile_id: profile_id.to_string(),
                    email: email.to_string(),
                    username: username.to_string(),
                    password_hash: password_hash.to_string(),
                    email_verified: false,
                },
                otp: Some(OtpState { code: code.clone(), expires_at_ms, attempts: 0 }),
                last_sent_ms: now_ms,
                sends_this_hour: 1,
                hour_start_ms: now_ms,
            },
        );
        inner.email_index.insert(email_key, account_id.clone());
        inner.username_index.insert(username_key, account_id.clone());
        if let Some(record) = inner.profiles.get_mut(profile_id) {
            record.linked_account = Some(account_id.clone());
        }
        Ok(PendingAccount { account_id, verification_code: code, expires_at_ms })
    }

    async fn resend_verification(
        &self,
        email: &str,
        code_ttl_ms: u64,
        cooldown_ms: u64,
        per_hour_cap: u32,
        now_ms: u64,
    ) -> Result<PendingAccount, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let account_id = inner
            .email_index
            .get(&email.to_ascii_lowercase())
            .cloned()
            .ok_or(IdentityError::ProfileNotFound)?;
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(IdentityError::ProfileNotFound)?;

        if now_ms.saturating_sub(account.hour_start_ms) >= 3_600_000 {
            account.hour_start_ms = now_ms;
            account.sends_this_hour = 0;
        }
        let since_last = now_ms.saturating_sub(account.last_sent_ms);
        if since_last < cooldown_ms {
            return Err(IdentityError::VerificationRateLimited {
                retry_after_ms: cooldown_ms - since_last,
            });
        }
        if account.sends_this_hour >= per_hour_cap {
            return Err(IdentityError::VerificationRateLimited {
                retry_after_ms: (account.hour_start_ms + 3_600_000).saturating_sub(now_ms),
            });
        }

        let code = verification_code();
        let expires_at_ms = now_ms + code_ttl_ms;
        account.otp = Some(OtpState { code: code.clone(), expires_at_ms, attempts: 0 });
        account.last_sent_ms = now_ms;
        account.sends_this_hour += 1;
        Ok(PendingAccount {
            account_id,
            verification_code: code,
            expires_at_ms,
        })
    }

    async fn verify_email_code(
        &self,
        email: &str,
        otp: &str,
        max_attempts: u32,
        now_ms: u64,
    ) -> Result<AccountRow, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let account_id = inner
            .email_index
            .get(&email.to_ascii_lowercase())
            .cloned()
            .ok_or(IdentityError::InvalidVerificationCode)?;
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(IdentityError::InvalidVerificationCode)?;
        let state = account
            .otp
            .as_mut()
            .ok_or(IdentityError::InvalidVerificationCode)?;
        if state.expires_at_ms <= now_ms {
            return Err(IdentityError::VerificationCodeExpired);
        }
        state.attempts += 1;
        if state.attempts > max_attempts || state.code != otp {
            return Err(IdentityError::InvalidVerificationCode);
        }
        account.otp = None;
        account.row.email_verified = true;
        Ok(account.row.clone())
    }

    async fn find_account_by_login(&self, email_or_username: &str) -> Option<AccountRow> {
        let inner = self.inner.lock().expect("identity store poisoned");
        let key = email_or_username.to_ascii_lowercase();
        let account_id = inner
            .email_index
            .get(&key)
            .or_else(|| inner.username_index.get(&key))?;
        inner.accounts.get(account_id).map(|a| a.row.clone())
    }

    async fn get_friends_state(&self, profile_id: &str) -> Result<FriendsState, IdentityError> {
        let inner = self.inner.lock().expect("identity store poisoned");
        inner.profile(profile_id)?;
        let friends = inner
            .friends
            .get(profile_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| inner.profiles.get(id))
                    .map(|p| p.info.clone())
                    .collect()
            })
            .unwrap_or_default();
        let incoming = inner
            .requests
            .values()
            .filter(|r| r.to_profile_id == profile_id)
            .cloned()
            .collect();
        let outgoing = inner
            .requests
            .values()
            .filter(|r| r.from_profile_id == profile_id)
            .cloned()
            .collect();
        Ok(FriendsState { friends, incoming, outgoing })
    }

    async fn search_friend_profiles(
        &self,
        profile_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ProfileInfo>, IdentityError> {
        let inner = self.inner.lock().expect("identity store poisoned");
        inner.profile(profile_id)?;
        let needle = query.trim().to_ascii_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        Ok(inner
            .profiles
            .values()
            .filter(|p| p.info.profile_id != profile_id)
            .filter(|p| {
                p.info.nickname.to_ascii_lowercase().contains(&needle)
                    || p.info.friend_code.to_ascii_lowercase() == needle
                    || p.info
                        .username
                        .as_deref()
                        .is_some_and(|u| u.to_ascii_lowercase().contains(&needle))
            })
            .take(limit)
            .map(|p| p.info.clone())
            .collect())
    }

    async fn send_friend_request(
        &self,
        from_profile_id: &str,
        to_profile_id: &str,
    ) -> Result<FriendRequestEntry, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let from = inner.profile(from_profile_id)?.info.clone();
        let to = inner.profile(to_profile_id)?.info.clone();
        if inner.are_friends(from_profile_id, to_profile_id) {
            return Err(IdentityError::AlreadyFriends);
        }
        if inner.open_request_between(from_profile_id, to_profile_id) {
            return Err(IdentityError::FriendRequestAlreadyExists);
        }
        let entry = FriendRequestEntry {
            request_id: short_id("freq"),
            from_profile_id: from.profile_id,
            from_nickname: from.nickname,
            to_profile_id: to.profile_id,
            to_nickname: to.nickname,
        };
        inner.requests.insert(entry.request_id.clone(), entry.clone());
        Ok(entry)
    }

    async fn respond_friend_request(
        &self,
        profile_id: &str,
        request_id: &str,
        accept: bool,
    ) -> Result<RespondOutcome, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let request = inner
            .requests
            .get(request_id)
            .cloned()
            .ok_or(IdentityError::FriendRequestNotFound)?;
        // Only the addressee may answer.
        if request.to_profile_id != profile_id {
            return Err(IdentityError::FriendRequestNotFound);
        }
        inner.requests.remove(request_id);
        let other = inner.profile(&request.from_profile_id)?.info.clone();
        if accept {
            inner
                .friends
                .entry(request.from_profile_id.clone())
                .or_default()
                .insert(request.to_profile_id.clone());
            inner
                .friends
                .entry(request.to_profile_id.clone())
                .or_default()
                .insert(request.from_profile_id.clone());
        }
        Ok(RespondOutcome {
            request_id: request_id.to_string(),
            accepted: accept,
            other_profile: other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(fut)
    }

    #[test]
    fn guest_profile_is_stable_per_device() {
        block_on(async {
            let store = InMemoryIdentityStore::default();
            let a = store.ensure_guest_profile("device-aaaaaa", "Ada").await.unwrap();
            let b = store.ensure_guest_profile("device-aaaaaa", "Other").await.unwrap();
            assert_eq!(a.profile_id, b.profile_id);
            assert!(a.is_guest);
            assert_eq!(a.friend_code.len(), 8);
        });
    }

    #[test]
    fn linking_guards_email_username_and_relink() {
        block_on(async {
            let store = InMemoryIdentityStore::default();
            let p1 = store.ensure_guest_profile("device-aaaaaa", "Ada").await.unwrap();
            let p2 = store.ensure_guest_profile("device-bbbbbb", "Bob").await.unwrap();
            store
                .create_pending_linked_account(&p1.profile_id, "a@x.io", "ada", "h", 60_000, 0)
                .await
                .unwrap();
            assert_eq!(
                store
                    .create_pending_linked_account(&p1.profile_id, "b@x.io", "ada2", "h", 60_000, 0)
                    .await
                    .unwrap_err(),
                IdentityError::ProfileAlreadyLinked
            );
            assert_eq!(
                store
                    .create_pending_linked_account(&p2.profile_id, "A@X.IO", "bob", "h", 60_000, 0)
                    .await
                    .unwrap_err(),
                IdentityError::EmailAlreadyUsed
            );
            assert_eq!(
                store
                    .create_pending_linked_account(&p2.profile_id, "b@x.io", "ADA", "h", 60_000, 0)
                    .await
                    .unwrap_err(),
                IdentityError::UsernameTaken
            );
        });
    }

    #[test]
    fn verification_flow_checks_code_expiry_and_attempts() {
        block_on(async {
            let store = InMemoryIdentityStore::default();
            let p = store.ensure_guest_profile("device-aaaaaa", "Ada").await.unwrap();
            let pending = store
                .create_pending_linked_account(&p.profile_id, "a@x.io", "ada", "h", 10_000, 0)
                .await
                .unwrap();
            assert_eq!(
                store.verify_email_code("a@x.io", "000000", 3, 1_000).await.unwrap_err(),
                IdentityError::InvalidVerificationCode
            );
            let row = store
                .verify_email_code("a@x.io", &pending.verification_code, 3, 1_000)
                .await
                .unwrap();
            assert!(row.email_verified);
            // Expired path.
            let pending = store
                .resend_verification("a@x.io", 10_000, 0, 10, 20_000)
                .await
                .unwrap();
            assert_eq!(
                store
                    .verify_email_code("a@x.io", &pending.verification_code, 3, 40_000)
                    .await
                    .unwrap_err(),
                IdentityError::VerificationCodeExpired
            );
        });
    }

    #[test]
    fn resend_cooldown_reports_retry_after() {
        block_on(async {
            let store = InMemoryIdentityStore::default();
            let p = store.ensure_guest_profile("device-aaaaaa", "Ada").await.unwrap();
            store
                .create_pending_linked_account(&p.profile_id, "a@x.io", "ada", "h", 10_000, 0)
                .await
                .unwrap();
            match store.resend_verification("a@x.io", 10_000, 30_000, 10, 5_000).await {
                Err(IdentityError::VerificationRateLimited { retry_after_ms }) => {
                    assert_eq!(retry_after_ms, 25_000);
                }
                other => panic!("expected rate limit, got {other:?}"),
            }
            assert!(store.resend_verification("a@x.io", 10_000, 30_000, 10, 30_000).await.is_ok());
        });
    }

    #[test]
    fn friend_request_lifecycle() {
        block_on(async {
            let store = InMemoryIdentityStore::default();
            let a = store.ensure_guest_profile("device-aaaaaa", "Ada").await.unwrap();
            let b = store.ensure_guest_profile("device-bbbbbb", "Bob").await.unwrap();

            let req = store
                .send_friend_request(&a.profile_id, &b.profile_id)
                .await
                .unwrap();
            assert_eq!(
                store
                    .send_friend_request(&b.profile_id, &a.profile_id)
                    .await
                    .unwrap_err(),
                IdentityError::FriendRequestAlreadyExists
            );
            // The sender cannot answer its own request.
            assert_eq!(
                store
                    .respond_friend_request(&a.profile_id, &req.request_id, true)
                    .await
                    .unwrap_err(),
                IdentityError::FriendRequestNotFound
            );
            let outcome = store
                .respond_friend_request(&b.profile_id, &req.request_id, true)
                .await
                .unwrap();
            assert!(outcome.accepted);
            assert_eq!(outcome.other_profile.profile_id, a.profile_id);

            let state = store.get_friends_state(&a.profile_id).await.unwrap();
            assert_eq!(state.friends.len(), 1);
            assert!(state.incoming.is_empty() && state.outgoing.is_empty());
            assert_eq!(
                store
                    .send_friend_request(&a.profile_id, &b.profile_id)
                    .await
                    .unwrap_err(),
                IdentityError::AlreadyFriends
            );
        });
    }

    #[test]
    fn search_matches_nickname_username_and_exact_friend_code() {
        block_on(async {
            let store = InMemoryIdentityStore::default();
            let me = store.ensure_guest_profile("device-aaaaaa", "Me").await.unwrap();
            let other = store.ensure_guest_profile("device-bbbbbb", "Skywalker").await.unwrap();
            let hits = store
                .search_friend_profiles(&me.profile_id, "walk", 10)
                .await
                .unwrap();
            assert_eq!(hits.len(), 1);
            let hits = store
                .search_friend_profiles(&me.profile_id, &other.friend_code.to_lowercase(), 10)
                .await
                .unwrap();
            assert_eq!(hits.len(), 1);
            // Self never shows up.
            let hits = store.search_friend_profiles(&me.profile_id, "me", 10).await.unwrap();
            assert!(hits.iter().all(|p| p.profile_id != me.profile_id));
        });
    }
}
