//! Command line.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tollgate::credential::{SCOPE_BALANCE_READ, SCOPE_INVOKE};
use tollgate::money::Usd;
use tollgate_ledger::{MemberRole, RecipientKind};

/// Metered-billing LLM proxy.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "CONFIG", default_value = "tollgate.toml", global = true)]
    pub config: PathBuf,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the proxy.
    Serve,
    /// Create or upgrade the ledger schema.
    InitDb,
    /// Create a user.
    CreateUser {
        /// Contact email.
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an app owned by a user.
    CreateApp {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Owning user id.
        #[arg(long)]
        owner: String,
        /// Markup multiplier in `[1, 10]`.
        #[arg(long, default_value = "1")]
        markup: Decimal,
        /// Referrer user id.
        #[arg(long)]
        referrer: Option<String>,
        /// Referrer share of the markup profit in `[0, 1]`.
        #[arg(long, default_value = "0")]
        referral_share: Decimal,
    },
    /// Add a user to an app.
    AddMember {
        /// App id.
        #[arg(long)]
        app: String,
        /// User id.
        #[arg(long)]
        user: String,
        /// Role in the app.
        #[arg(long, value_enum, default_value_t = Role::Customer)]
        role: Role,
    },
    /// Provision an API key bound to a user and app.
    CreateApiKey {
        /// User id.
        #[arg(long)]
        user: String,
        /// App id.
        #[arg(long)]
        app: String,
        /// Space-separated scopes.
        #[arg(long, default_value = "*")]
        scope: String,
        /// Label.
        #[arg(long)]
        name: Option<String>,
    },
    /// Mint a short-lived access token.
    IssueToken {
        /// User id.
        #[arg(long)]
        user: String,
        /// App id.
        #[arg(long)]
        app: String,
        /// Space-separated scopes.
        #[arg(long, default_value_t = default_token_scope())]
        scope: String,
        /// Lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
    /// Revoke an access token until it expires.
    RevokeToken {
        /// The token.
        token: String,
    },
    /// Archive a user, app or API key. Its credentials stop working.
    Archive {
        /// What to archive.
        #[arg(value_enum)]
        kind: ArchiveKind,
        /// Its id.
        id: String,
    },
    /// Credit a user's prepaid balance.
    Credit {
        /// User id.
        #[arg(long)]
        user: String,
        /// USD amount.
        #[arg(long)]
        amount: Usd,
        /// External reference; repeating it credits nothing.
        #[arg(long)]
        reference: String,
    },
    /// Fund an app's free-tier spend pool.
    FundPool {
        /// App id.
        #[arg(long)]
        app: String,
        /// USD amount to add.
        #[arg(long)]
        amount: Usd,
        /// Cap on what any single user may draw.
        #[arg(long)]
        per_user_limit: Option<Usd>,
    },
    /// Show a user's prepaid balance.
    Balance {
        /// User id.
        #[arg(long)]
        user: String,
    },
    /// Pending payouts.
    Payouts {
        /// Payout action.
        #[command(subcommand)]
        action: PayoutAction,
    },
    /// List transactions needing attention, optionally retrying settlements.
    Reconcile {
        /// Retry pending x402 settlements and refunds first.
        #[arg(long)]
        retry: bool,
        /// Mark a reconciliation item as handled.
        #[arg(long, conflicts_with = "retry")]
        resolve: Option<i64>,
    },
}

/// Payout subcommands.
#[derive(Debug, Subcommand)]
pub enum PayoutAction {
    /// Sum pending payouts per recipient.
    List,
    /// Mark one recipient's pending payouts as paid.
    Complete {
        /// Recipient kind.
        #[arg(long, value_enum)]
        kind: Recipient,
        /// App id or referrer user id.
        #[arg(long)]
        recipient: String,
    },
}

/// Archivable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ArchiveKind {
    /// A user.
    User,
    /// An app.
    App,
    /// An API key.
    ApiKey,
}

/// App membership role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Owns the app.
    Owner,
    /// Uses the app.
    Customer,
}

impl From<Role> for MemberRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Owner => Self::Owner,
            Role::Customer => Self::Customer,
        }
    }
}

/// Payout recipient kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Recipient {
    /// An app.
    App,
    /// A referrer.
    Referrer,
}

impl From<Recipient> for RecipientKind {
    fn from(kind: Recipient) -> Self {
        match kind {
            Recipient::App => Self::App,
            Recipient::Referrer => Self::Referrer,
        }
    }
}

fn default_token_scope() -> String {
    format!("{SCOPE_INVOKE} {SCOPE_BALANCE_READ}")
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_credit_amounts_as_usd() {
        let cli = Cli::try_parse_from([
            "tollgate", "credit", "--user", "usr_1", "--amount", "12.50", "--reference", "r1",
        ])
        .unwrap();
        let Command::Credit { amount, .. } = cli.command else {
            panic!("expected credit");
        };
        assert_eq!(amount, Usd::parse("12.5").unwrap());
    }

    #[test]
    fn issue_token_defaults_to_invoke_and_balance_scopes() {
        let cli = Cli::try_parse_from([
            "tollgate", "--config", "x.toml", "issue-token", "--user", "u", "--app", "a",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        let Command::IssueToken { scope, ttl_secs, .. } = cli.command else {
            panic!("expected issue-token");
        };
        assert_eq!(scope, "llm:invoke balance:read");
        assert_eq!(ttl_secs, 3600);
    }

    #[test]
    fn archive_takes_kind_then_id() {
        let cli = Cli::try_parse_from(["tollgate", "archive", "api-key", "key_1"]).unwrap();
        let Command::Archive { kind, id } = cli.command else {
            panic!("expected archive");
        };
        assert_eq!(kind, ArchiveKind::ApiKey);
        assert_eq!(id, "key_1");
    }

    #[test]
    fn payouts_complete_takes_a_recipient_kind() {
        let cli = Cli::try_parse_from([
            "tollgate", "payouts", "complete", "--kind", "referrer", "--recipient", "usr_9",
        ])
        .unwrap();
        let Command::Payouts {
            action: PayoutAction::Complete { kind, recipient },
        } = cli.command
        else {
            panic!("expected payouts complete");
        };
        assert_eq!(RecipientKind::from(kind), RecipientKind::Referrer);
        assert_eq!(recipient, "usr_9");
    }
}
