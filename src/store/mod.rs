//! In-memory object store.
//!
//! Every protocol entity lives here, keyed by an opaque random identifier. Reads hand out clones;
//! writes go through closures applied to a scratch copy that is only committed when the closure
//! succeeds, so a failed update never leaves an entity half-modified.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};

use crate::{api::Problem, jws::Jwk, util::random_token};

mod entity;

pub use self::entity::{
    AccountEntry, AuthorizationEntry, CertificateEntry, ChallengeEntry, OrderEntry,
    RevocationEntry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    AlreadyExists,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => f.write_str("entity not found"),
            StoreError::AlreadyExists => f.write_str("entity already exists"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for Problem {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Problem::not_found(err.to_string()),
            StoreError::AlreadyExists => Problem::conflict(err.to_string()),
        }
    }
}

/// One entity type, guarded by its own lock.
struct Table<T> {
    rows: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Table<T> {
    fn new() -> Self {
        Table {
            rows: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, id: &str) -> Result<T, StoreError> {
        self.rows.read().get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn insert(&self, id: &str, row: T) -> Result<(), StoreError> {
        let mut rows = self.rows.write();

        if rows.contains_key(id) {
            return Err(StoreError::AlreadyExists);
        }

        rows.insert(id.to_owned(), row);
        Ok(())
    }

    fn update<R, E>(&self, id: &str, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut rows = self.rows.write();
        let row = rows.get_mut(id).ok_or(StoreError::NotFound)?;

        let mut scratch = row.clone();
        let res = f(&mut scratch)?;
        *row = scratch;

        Ok(res)
    }

    fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.rows.read().values().find(|row| pred(row)).cloned()
    }

    fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .read()
            .values()
            .filter(|row| pred(row))
            .cloned()
            .collect()
    }
}

pub struct Store {
    seq: AtomicU64,

    accounts: Table<AccountEntry>,
    orders: Table<OrderEntry>,
    authorizations: Table<AuthorizationEntry>,
    challenges: Table<ChallengeEntry>,
    certificates: Table<CertificateEntry>,

    nonces: Mutex<HashSet<String>>,

    external_keys: HashMap<String, Vec<u8>>,
    blocklist: Vec<String>,
}

impl Store {
    /// Creates an empty store.
    ///
    /// The external account keys and domain blocklist are fixed for the store's lifetime.
    pub fn new(external_keys: HashMap<String, Vec<u8>>, blocklist: Vec<String>) -> Self {
        Store {
            seq: AtomicU64::new(0),
            accounts: Table::new(),
            orders: Table::new(),
            authorizations: Table::new(),
            challenges: Table::new(),
            certificates: Table::new(),
            nonces: Mutex::new(HashSet::new()),
            external_keys,
            blocklist: blocklist
                .into_iter()
                .map(|domain| domain.trim_start_matches("*.").to_ascii_lowercase())
                .collect(),
        }
    }

    /// Fresh opaque identifier for a new entity.
    pub fn generate_id(&self) -> String {
        random_token(16)
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    // nonces

    pub fn new_nonce(&self) -> String {
        let nonce = random_token(16);
        self.nonces.lock().insert(nonce.clone());
        nonce
    }

    /// Consumes a nonce; fails if it is unknown or was already redeemed.
    pub fn redeem_nonce(&self, nonce: &str) -> Result<(), StoreError> {
        if self.nonces.lock().remove(nonce) {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    // policy tables

    /// MAC key provisioned for an external account key ID.
    pub fn external_key(&self, kid: &str) -> Option<&[u8]> {
        self.external_keys.get(kid).map(Vec::as_slice)
    }

    /// Returns true if `domain`, or any of its parent domains, is blocked.
    pub fn is_blocked(&self, domain: &str) -> bool {
        let domain = domain.trim_start_matches("*.").to_ascii_lowercase();

        self.blocklist.iter().any(|blocked| {
            domain == *blocked
                || domain
                    .strip_suffix(blocked.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    // accounts

    /// Stores a new account; fails if another account is bound to the same key.
    pub fn add_account(&self, account: AccountEntry) -> Result<AccountEntry, StoreError> {
        let mut rows = self.accounts.rows.write();

        if rows.contains_key(&account.id) || rows.values().any(|row| row.key.same_key(&account.key))
        {
            return Err(StoreError::AlreadyExists);
        }

        rows.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    pub fn account(&self, id: &str) -> Result<AccountEntry, StoreError> {
        self.accounts.get(id)
    }

    pub fn account_by_key(&self, key: &Jwk) -> Option<AccountEntry> {
        self.accounts.find(|row| row.key.same_key(key))
    }

    pub fn update_account<R, E: From<StoreError>>(
        &self,
        id: &str,
        f: impl FnOnce(&mut AccountEntry) -> Result<R, E>,
    ) -> Result<R, E> {
        self.accounts.update(id, f)
    }

    /// Binds `key` to account `id`; fails if the key belongs to any other account.
    pub fn rekey_account(&self, id: &str, key: Jwk) -> Result<AccountEntry, StoreError> {
        let mut rows = self.accounts.rows.write();

        if rows
            .values()
            .any(|row| row.id != id && row.key.same_key(&key))
        {
            return Err(StoreError::AlreadyExists);
        }

        let row = rows.get_mut(id).ok_or(StoreError::NotFound)?;
        row.key = key;
        Ok(row.clone())
    }

    // orders

    pub fn add_order(&self, order: OrderEntry) -> Result<OrderEntry, StoreError> {
        self.orders.insert(&order.id, order.clone())?;
        Ok(order)
    }

    pub fn order(&self, id: &str) -> Result<OrderEntry, StoreError> {
        self.orders.get(id)
    }

    pub fn update_order<R, E: From<StoreError>>(
        &self,
        id: &str,
        f: impl FnOnce(&mut OrderEntry) -> Result<R, E>,
    ) -> Result<R, E> {
        self.orders.update(id, f)
    }

    /// Orders owned by an account, oldest first.
    pub fn orders_by_account(&self, account_id: &str) -> Vec<OrderEntry> {
        let mut orders = self.orders.filter(|row| row.account_id == account_id);
        orders.sort_by_key(|order| order.seq);
        orders
    }

    // authorizations

    pub fn add_authorization(
        &self,
        authz: AuthorizationEntry,
    ) -> Result<AuthorizationEntry, StoreError> {
        self.authorizations.insert(&authz.id, authz.clone())?;
        Ok(authz)
    }

    pub fn authorization(&self, id: &str) -> Result<AuthorizationEntry, StoreError> {
        self.authorizations.get(id)
    }

    pub fn update_authorization<R, E: From<StoreError>>(
        &self,
        id: &str,
        f: impl FnOnce(&mut AuthorizationEntry) -> Result<R, E>,
    ) -> Result<R, E> {
        self.authorizations.update(id, f)
    }

    pub fn find_authorization(
        &self,
        pred: impl Fn(&AuthorizationEntry) -> bool,
    ) -> Option<AuthorizationEntry> {
        self.authorizations.find(pred)
    }

    pub fn authorizations_by_account(&self, account_id: &str) -> Vec<AuthorizationEntry> {
        self.authorizations
            .filter(|row| row.account_id == account_id)
    }

    // challenges

    pub fn add_challenge(&self, chall: ChallengeEntry) -> Result<ChallengeEntry, StoreError> {
        self.challenges.insert(&chall.id, chall.clone())?;
        Ok(chall)
    }

    pub fn challenge(&self, id: &str) -> Result<ChallengeEntry, StoreError> {
        self.challenges.get(id)
    }

    pub fn update_challenge<R, E: From<StoreError>>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ChallengeEntry) -> Result<R, E>,
    ) -> Result<R, E> {
        self.challenges.update(id, f)
    }

    // certificates

    /// Stores an issued certificate; fails if its ID or serial number is already taken.
    pub fn add_certificate(&self, cert: CertificateEntry) -> Result<CertificateEntry, StoreError> {
        let mut rows = self.certificates.rows.write();

        if rows.contains_key(&cert.id) || rows.values().any(|row| row.serial == cert.serial) {
            return Err(StoreError::AlreadyExists);
        }

        rows.insert(cert.id.clone(), cert.clone());
        Ok(cert)
    }

    pub fn certificate(&self, id: &str) -> Result<CertificateEntry, StoreError> {
        self.certificates.get(id)
    }

    pub fn certificate_by_serial(&self, serial: &str) -> Option<CertificateEntry> {
        self.certificates.find(|row| row.serial == serial)
    }

    pub fn certificate_by_der(&self, der: &[u8]) -> Option<CertificateEntry> {
        self.certificates.find(|row| row.der == der)
    }

    pub fn update_certificate<R, E: From<StoreError>>(
        &self,
        id: &str,
        f: impl FnOnce(&mut CertificateEntry) -> Result<R, E>,
    ) -> Result<R, E> {
        self.certificates.update(id, f)
    }
}
