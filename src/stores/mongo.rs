//! MongoDB backed [`DocumentStore`].
//!
//! Transactions need a replica set (a single node one is enough); setting it
//! up is outside the scope of this crate.

use async_trait::async_trait;
use mongodb::bson::{doc, Decimal128, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::{Client, ClientSession, Database};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DocumentStore, StoreSession};
use crate::dto::{Account, Collection, Filter, User};
use crate::error::StoreError;

const DUPLICATE_KEY: i32 = 11000;

// IEEE 754-2008 decimal128, binary integer decimal encoding.
const EXPONENT_BIAS: i32 = 6176;
const EXPONENT_MASK: u128 = 0x3FFF;
const COEFFICIENT_BITS: u32 = 113;
const MAX_SCALE: i32 = 28;

fn backend(err: MongoError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

fn insert_error(err: MongoError, collection: Collection, id: u32) -> StoreError {
    if is_duplicate_key(&err) {
        StoreError::DuplicateKey { collection, id }
    } else {
        backend(err)
    }
}

fn filter_document(filter: &Filter) -> Document {
    match filter {
        Filter::All => doc! {},
        Filter::Ids(ids) => {
            let ids: Vec<i64> = ids.iter().map(|id| i64::from(*id)).collect();
            doc! { "_id": { "$in": ids } }
        }
    }
}

/// Encodes a balance as a BSON `Decimal128` so `$inc` stays exact on the server.
fn to_decimal128(value: Decimal) -> Decimal128 {
    let coefficient = value.mantissa().unsigned_abs();
    let exponent = (EXPONENT_BIAS - value.scale() as i32) as u128;
    let sign = u128::from(value.is_sign_negative()) << 127;
    let bits = sign | exponent << COEFFICIENT_BITS | coefficient;
    Decimal128::from_bytes(bits.to_le_bytes())
}

fn from_decimal128(value: Decimal128) -> Result<Decimal, StoreError> {
    let unrepresentable = || StoreError::Backend(format!("balance {value:?} does not fit a decimal"));
    let bits = u128::from_le_bytes(value.bytes());
    // Infinity, NaN and non canonical coefficients.
    if (bits >> 125) & 0b11 == 0b11 {
        return Err(unrepresentable());
    }
    let negative = bits >> 127 == 1;
    let mut exponent = ((bits >> COEFFICIENT_BITS) & EXPONENT_MASK) as i32 - EXPONENT_BIAS;
    let mut coefficient = bits & ((1u128 << COEFFICIENT_BITS) - 1);

    while exponent > 0 {
        coefficient = coefficient.checked_mul(10).ok_or_else(unrepresentable)?;
        exponent -= 1;
    }
    while exponent < 0 && coefficient % 10 == 0 && (exponent < -MAX_SCALE || coefficient >> 96 != 0)
    {
        coefficient /= 10;
        exponent += 1;
    }
    if exponent < -MAX_SCALE {
        return Err(unrepresentable());
    }

    let mantissa = i128::try_from(coefficient).map_err(|_| unrepresentable())?;
    let mantissa = if negative { -mantissa } else { mantissa };
    Decimal::try_from_i128_with_scale(mantissa, exponent.unsigned_abs()).map_err(|_| unrepresentable())
}

/// The stored shape of an [`Account`].
#[derive(Debug, Serialize, Deserialize)]
struct AccountDocument {
    #[serde(rename = "_id")]
    id: i64,
    #[serde(rename = "userId")]
    user_id: i64,
    balance: Decimal128,
}

impl From<&Account> for AccountDocument {
    fn from(account: &Account) -> Self {
        Self {
            id: i64::from(account.id),
            user_id: i64::from(account.user_id),
            balance: to_decimal128(account.balance),
        }
    }
}

impl TryFrom<AccountDocument> for Account {
    type Error = StoreError;

    fn try_from(document: AccountDocument) -> Result<Self, Self::Error> {
        let id = |value: i64| {
            u32::try_from(value)
                .map_err(|_| StoreError::Backend(format!("account id {value} out of range")))
        };
        Ok(Account {
            id: id(document.id)?,
            user_id: id(document.user_id)?,
            balance: from_decimal128(document.balance)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await.map_err(backend)?;
        info!(database, "connected to MongoDB");
        Ok(Self {
            database: client.database(database),
            client,
        })
    }

    fn raw(&self, collection: Collection) -> mongodb::Collection<Document> {
        self.database.collection(collection.name())
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    type Session = MongoSession;

    async fn delete_many(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        let result = self
            .raw(collection)
            .delete_many(filter_document(filter))
            .await
            .map_err(backend)?;
        Ok(result.deleted_count)
    }

    async fn start_session(&self) -> Result<MongoSession, StoreError> {
        let session = self.client.start_session().await.map_err(backend)?;
        Ok(MongoSession {
            session,
            database: self.database.clone(),
        })
    }

    async fn count_documents(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        self.raw(collection)
            .count_documents(filter_document(filter))
            .await
            .map_err(backend)
    }

    async fn find_account(&self, id: u32) -> Result<Option<Account>, StoreError> {
        self.database
            .collection::<AccountDocument>(Collection::Accounts.name())
            .find_one(doc! { "_id": i64::from(id) })
            .await
            .map_err(backend)?
            .map(Account::try_from)
            .transpose()
    }
}

/// Writes issued through this session run inside its transaction.
pub struct MongoSession {
    session: ClientSession,
    database: Database,
}

#[async_trait]
impl StoreSession for MongoSession {
    async fn start_transaction(&mut self) -> Result<(), StoreError> {
        self.session.start_transaction().await.map_err(backend)
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.database
            .collection::<User>(Collection::Users.name())
            .insert_one(user)
            .session(&mut self.session)
            .await
            .map_err(|err| insert_error(err, Collection::Users, user.id))?;
        Ok(())
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.database
            .collection::<AccountDocument>(Collection::Accounts.name())
            .insert_one(AccountDocument::from(account))
            .session(&mut self.session)
            .await
            .map_err(|err| insert_error(err, Collection::Accounts, account.id))?;
        Ok(())
    }

    async fn increment_balance(
        &mut self,
        account_id: u32,
        delta: Decimal,
    ) -> Result<(), StoreError> {
        let result = self
            .database
            .collection::<Document>(Collection::Accounts.name())
            .update_one(
                doc! { "_id": i64::from(account_id) },
                doc! { "$inc": { "balance": to_decimal128(delta) } },
            )
            .session(&mut self.session)
            .await
            .map_err(backend)?;
        if result.matched_count == 0 {
            return Err(StoreError::DocumentNotFound {
                collection: Collection::Accounts,
                id: account_id,
            });
        }
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), StoreError> {
        self.session.commit_transaction().await.map_err(backend)
    }

    async fn abort_transaction(&mut self) -> Result<(), StoreError> {
        self.session.abort_transaction().await.map_err(backend)
    }

    async fn end_session(self) {
        // The driver ends the server session when the handle is dropped.
        drop(self.session);
        debug!("session ended");
    }
}
