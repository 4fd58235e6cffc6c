//! Users, apps, memberships, API keys, token revocation and balances.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tollgate::credential::{
    ApiKeyHasher, ApiKeyRecord, CredentialStore, Scope, StoreError, generate_api_key,
};
use tollgate::money::Usd;
use tollgate::pricing::Markup;
use tollgate::timestamp::UnixTimestamp;

use crate::error::is_unique_violation;
use crate::records::{ApiKey, App, MemberRole, NewApp, PoolBalance, User, UserBalance};
use crate::{Ledger, LedgerError, new_id, now, units};

type AppRow = (String, String, String, Option<String>, String, bool);

impl Ledger {
    /// Creates a user with an empty balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn create_user(&self, email: Option<&str>) -> Result<User, LedgerError> {
        let id = new_id("usr");
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(email)
            .bind(now())
            .execute(&self.pool)
            .await?;
        tracing::info!(user_id = %id, "User created");
        Ok(User {
            id,
            email: email.map(str::to_owned),
            total_paid: Usd::ZERO,
            total_spent: Usd::ZERO,
            archived: false,
        })
    }

    /// Loads a user.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the user does not exist.
    pub async fn user(&self, user_id: &str) -> Result<User, LedgerError> {
        let row = sqlx::query_as::<_, (String, Option<String>, i64, i64, bool)>(
            "SELECT id, email, total_paid, total_spent, archived FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("user {user_id}")))?;
        Ok(User {
            id: row.0,
            email: row.1,
            total_paid: Usd::from_ledger_units(row.2),
            total_spent: Usd::from_ledger_units(row.3),
            archived: row.4,
        })
    }

    /// Archives a user. Their credentials stop working immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the user does not exist.
    pub async fn archive_user(&self, user_id: &str) -> Result<(), LedgerError> {
        let affected = sqlx::query("UPDATE users SET archived = 1 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(LedgerError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    /// Creates an app and makes `owner_user_id` its owner.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] for a referral share outside
    /// `[0, 1]` and [`LedgerError::NotFound`] for an unknown owner.
    pub async fn create_app(&self, new: NewApp) -> Result<App, LedgerError> {
        if new.referral_share < Decimal::ZERO || new.referral_share > Decimal::ONE {
            return Err(LedgerError::InvalidArgument(format!(
                "referral share {} must be between 0 and 1",
                new.referral_share
            )));
        }
        let id = new_id("app");
        let ts = now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO apps (id, name, markup, referrer_user_id, referral_share, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.markup.multiplier().to_string())
        .bind(&new.referrer_user_id)
        .bind(new.referral_share.to_string())
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|err| foreign_key_to_not_found(err, "referrer user"))?;
        sqlx::query(
            "INSERT INTO app_members (app_id, user_id, role, created_at) VALUES (?, ?, 'owner', ?)",
        )
        .bind(&id)
        .bind(&new.owner_user_id)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|err| foreign_key_to_not_found(err, "owner user"))?;
        tx.commit().await?;
        tracing::info!(app_id = %id, markup = %new.markup.multiplier(), "App created");
        Ok(App {
            id,
            name: new.name,
            markup: new.markup,
            referrer_user_id: new.referrer_user_id,
            referral_share: new.referral_share,
            archived: false,
        })
    }

    /// Loads an app.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the app does not exist.
    pub async fn app(&self, app_id: &str) -> Result<App, LedgerError> {
        let row = sqlx::query_as::<_, AppRow>(
            "SELECT id, name, markup, referrer_user_id, referral_share, archived \
             FROM apps WHERE id = ?",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("app {app_id}")))?;
        app_from_row(row)
    }

    /// Archives an app. Keys bound to it stop working immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the app does not exist.
    pub async fn archive_app(&self, app_id: &str) -> Result<(), LedgerError> {
        let affected = sqlx::query("UPDATE apps SET archived = 1 WHERE id = ?")
            .bind(app_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(LedgerError::NotFound(format!("app {app_id}")));
        }
        Ok(())
    }

    /// Adds a user to an app. An existing membership keeps its role.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown user or app.
    pub async fn add_member(
        &self,
        app_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO app_members (app_id, user_id, role, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (app_id, user_id) DO NOTHING",
        )
        .bind(app_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|err| foreign_key_to_not_found(err, "user or app"))?;
        Ok(())
    }

    /// Returns the user's role in the app, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn membership(
        &self,
        app_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRole>, LedgerError> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM app_members WHERE app_id = ? AND user_id = ?",
        )
        .bind(app_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        role.as_deref().map(MemberRole::parse).transpose()
    }

    /// Provisions an API key for `user_id` bound to `app_id`, adding the user
    /// to the app as a customer if needed.
    ///
    /// Returns the plaintext key, which is never stored.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown user or app.
    pub async fn create_api_key(
        &self,
        user_id: &str,
        app_id: &str,
        scope: Scope,
        name: Option<&str>,
        hasher: &ApiKeyHasher,
    ) -> Result<(String, ApiKey), LedgerError> {
        let plaintext = generate_api_key()
            .map_err(|err| LedgerError::InvalidArgument(err.to_string()))?;
        let id = new_id("key");
        let ts = now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO api_keys (id, key_hash, user_id, app_id, scope, name, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(hasher.hash(&plaintext))
        .bind(user_id)
        .bind(app_id)
        .bind(scope.as_str())
        .bind(name)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|err| foreign_key_to_not_found(err, "user or app"))?;
        sqlx::query(
            "INSERT INTO app_members (app_id, user_id, role, created_at) \
             VALUES (?, ?, 'customer', ?) ON CONFLICT (app_id, user_id) DO NOTHING",
        )
        .bind(app_id)
        .bind(user_id)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(key_id = %id, user_id, app_id, "API key created");
        Ok((
            plaintext,
            ApiKey {
                id,
                user_id: user_id.to_owned(),
                app_id: app_id.to_owned(),
                scope,
                name: name.map(str::to_owned),
            },
        ))
    }

    /// Archives (revokes) an API key.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the key does not exist.
    pub async fn archive_api_key(&self, key_id: &str) -> Result<(), LedgerError> {
        let affected = sqlx::query("UPDATE api_keys SET archived = 1 WHERE id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(LedgerError::NotFound(format!("api key {key_id}")));
        }
        tracing::info!(key_id, "API key archived");
        Ok(())
    }

    /// Looks up a key by hash together with its owner and app archival state.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, LedgerError> {
        let row = sqlx::query_as::<_, (String, String, String, String, bool, bool, bool)>(
            "SELECT k.id, k.user_id, k.app_id, k.scope, k.archived, u.archived, a.archived \
             FROM api_keys k \
             JOIN users u ON u.id = k.user_id \
             JOIN apps a ON a.id = k.app_id \
             WHERE k.key_hash = ?",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(id, user_id, app_id, scope, key_archived, user_archived, app_archived)| {
                ApiKeyRecord {
                    id,
                    user_id,
                    app_id,
                    scope: Scope::new(scope),
                    key_archived,
                    user_archived,
                    app_archived,
                }
            },
        ))
    }

    /// Revokes an access token by id until it would have expired anyway.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn revoke_token(
        &self,
        jti: &str,
        expires_at: UnixTimestamp,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO revoked_tokens (jti, expires_at) VALUES (?, ?) \
             ON CONFLICT (jti) DO NOTHING",
        )
        .bind(jti)
        .bind(expires_at.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns `true` if the token id was revoked.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn token_revoked(&self, jti: &str) -> Result<bool, LedgerError> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM revoked_tokens WHERE jti = ?")
            .bind(jti)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Drops revocations of tokens that have expired. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn purge_expired_revocations(&self) -> Result<u64, LedgerError> {
        Ok(sqlx::query("DELETE FROM revoked_tokens WHERE expires_at < ?")
            .bind(now())
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    /// Credits a user's prepaid balance from an out-of-band payment.
    ///
    /// `external_id` makes the credit idempotent: repeating it returns `false`
    /// and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] for a non-positive amount and
    /// [`LedgerError::NotFound`] for an unknown user.
    pub async fn credit_user(
        &self,
        user_id: &str,
        amount: Usd,
        external_id: &str,
    ) -> Result<bool, LedgerError> {
        let amount_units = positive_units(amount)?;
        let ts = now();
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO payments (id, external_id, user_id, kind, amount, status, created_at, updated_at) \
             VALUES (?, ?, ?, 'card', ?, 'completed', ?, ?) ON CONFLICT (external_id) DO NOTHING",
        )
        .bind(new_id("pay"))
        .bind(external_id)
        .bind(user_id)
        .bind(amount_units)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|err| foreign_key_to_not_found(err, "user"))?
        .rows_affected();
        if inserted == 0 {
            return Ok(false);
        }
        let credited = sqlx::query("UPDATE users SET total_paid = total_paid + ? WHERE id = ?")
            .bind(amount_units)
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if credited == 0 {
            return Err(LedgerError::NotFound(format!("user {user_id}")));
        }
        tx.commit().await?;
        tracing::info!(user_id, %amount, external_id, "User balance credited");
        Ok(true)
    }

    /// Adds funds to an app's spend pool, creating it if needed, and sets the
    /// per-user limit when one is given.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] for a negative amount and
    /// [`LedgerError::NotFound`] for an unknown app.
    pub async fn fund_spend_pool(
        &self,
        app_id: &str,
        amount: Usd,
        per_user_limit: Option<Usd>,
    ) -> Result<PoolBalance, LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidArgument(format!(
                "pool funding {amount} must not be negative"
            )));
        }
        let amount_units = units(amount)?;
        let limit_units = per_user_limit.map(units).transpose()?;
        sqlx::query(
            "INSERT INTO spend_pools (app_id, total_funded, per_user_limit) VALUES (?, ?, ?) \
             ON CONFLICT (app_id) DO UPDATE SET \
                 total_funded = total_funded + excluded.total_funded, \
                 per_user_limit = COALESCE(excluded.per_user_limit, per_user_limit)",
        )
        .bind(app_id)
        .bind(amount_units)
        .bind(limit_units)
        .execute(&self.pool)
        .await
        .map_err(|err| foreign_key_to_not_found(err, "app"))?;
        tracing::info!(app_id, %amount, "Spend pool funded");
        self.spend_pool_balance(app_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("spend pool {app_id}")))
    }

    /// The user's prepaid balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the user does not exist.
    pub async fn user_balance(&self, user_id: &str) -> Result<UserBalance, LedgerError> {
        let user = self.user(user_id).await?;
        Ok(UserBalance {
            user_id: user.id,
            balance: user.total_paid - user.total_spent,
            total_paid: user.total_paid,
            total_spent: user.total_spent,
        })
    }

    /// The app's spend pool, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn spend_pool_balance(
        &self,
        app_id: &str,
    ) -> Result<Option<PoolBalance>, LedgerError> {
        let row = sqlx::query_as::<_, (i64, i64, Option<i64>)>(
            "SELECT total_funded, total_spent, per_user_limit FROM spend_pools WHERE app_id = ?",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(funded, spent, limit)| PoolBalance {
            app_id: app_id.to_owned(),
            balance: Usd::from_ledger_units(funded - spent),
            total_funded: Usd::from_ledger_units(funded),
            total_spent: Usd::from_ledger_units(spent),
            per_user_limit: limit.map(Usd::from_ledger_units),
        }))
    }

    /// How much `user_id` has drawn from the app's spend pool.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn spend_pool_usage(&self, app_id: &str, user_id: &str) -> Result<Usd, LedgerError> {
        let spent = sqlx::query_scalar::<_, i64>(
            "SELECT spent FROM spend_pool_usage WHERE app_id = ? AND user_id = ?",
        )
        .bind(app_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(Usd::from_ledger_units(spent.unwrap_or(0)))
    }
}

#[async_trait]
impl CredentialStore for Ledger {
    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.find_api_key_by_hash(key_hash).await?)
    }

    async fn is_token_revoked(&self, jti: &str) -> Result<bool, StoreError> {
        Ok(self.token_revoked(jti).await?)
    }
}

pub(crate) fn app_from_row(row: AppRow) -> Result<App, LedgerError> {
    let (id, name, markup, referrer_user_id, share, archived) = row;
    let multiplier = markup.parse::<Decimal>().map_err(|_| LedgerError::Corrupt {
        column: "apps.markup",
        value: markup.clone(),
    })?;
    let markup = Markup::new(multiplier)?;
    let referral_share = share.parse::<Decimal>().map_err(|_| LedgerError::Corrupt {
        column: "apps.referral_share",
        value: share.clone(),
    })?;
    Ok(App {
        id,
        name,
        markup,
        referrer_user_id,
        referral_share,
        archived,
    })
}

fn positive_units(amount: Usd) -> Result<i64, LedgerError> {
    let value = units(amount)?;
    if value <= 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "amount {amount} must be positive"
        )));
    }
    Ok(value)
}

pub(crate) fn foreign_key_to_not_found(err: sqlx::Error, what: &str) -> LedgerError {
    match &err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            LedgerError::NotFound(what.to_owned())
        }
        _ if is_unique_violation(&err) => LedgerError::InvalidArgument(format!("{what} already exists")),
        _ => LedgerError::Database(err),
    }
}
