pub mod accounts;
pub mod keys;
pub mod ops;
pub mod tasks;

use clap::{Parser, Subcommand};

use crate::account::AccountStatus;

#[derive(Parser)]
#[command(name = "custodian")]
#[command(about = "Custodied messaging account lifecycle", long_about = None)]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "custodian.toml")]
    pub config: String,
    /// Operator recorded in the audit log
    #[arg(long, global = true, default_value = "operator")]
    pub operator: String,
    /// Operator address recorded in the audit log
    #[arg(long, global = true)]
    pub ip: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print a fresh vault master key
    GenKey,
    /// Start onboarding: request a login code for a new account
    Enroll {
        #[arg(long)]
        phone: String,
        #[arg(long)]
        employee_id: String,
        #[arg(long)]
        employee_name: String,
        #[arg(long)]
        recovery_email: String,
        #[arg(long)]
        note: Option<String>,
        /// Name of a configured proxy
        #[arg(long)]
        proxy: Option<String>,
    },
    /// Finish onboarding or reauthorization with a code or 2FA password
    Verify {
        #[arg(long)]
        phone: String,
        #[arg(long, conflicts_with = "password", required_unless_present = "password")]
        code: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Liveness and security check of one account
    Check {
        phone: String,
    },
    /// Check accounts one after another, paced
    BulkCheck {
        /// Phones to check; every active account when omitted
        phones: Vec<String>,
    },
    /// Rotate the account's 2FA password
    ChangePassword {
        phone: String,
        #[arg(long)]
        old_password: Option<String>,
        /// Generated when omitted
        #[arg(long)]
        new_password: Option<String>,
        /// Print the stored password after a successful change
        #[arg(long, default_value = "false")]
        print_password: bool,
    },
    /// Terminate every device session and rotate credentials
    Reclaim {
        phone: String,
        /// Current 2FA password; overrides the stored one
        #[arg(long)]
        two_factor_password: Option<String>,
    },
    /// Send a fresh login code for an existing account
    Reauthorize {
        phone: String,
    },
    /// Administratively suspend an active account
    Suspend {
        phone: String,
    },
    /// List accounts
    Accounts {
        #[arg(long)]
        status: Option<AccountStatus>,
    },
    /// Show one account (no secrets)
    Show {
        phone: String,
    },
    /// Audit records, most recent first
    Audit {
        phone: Option<String>,
        #[arg(long, default_value_t = crate::audit::DEFAULT_LISTING_LIMIT)]
        limit: usize,
    },
    /// Task records
    Tasks {
        #[command(subcommand)]
        cmd: tasks::TaskCommands,
    },
    /// Run the scheduler daemon until Ctrl-C
    Serve,
}
