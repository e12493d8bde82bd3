use alloy::primitives::{utils::parse_ether, Address, U256};
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use lifecycle::{JobStatus, UserId};
use serde::Serialize;
use url::Url;

#[derive(Clone, Parser)]
#[command(author, version, about = "Operate the escrow job lifecycle service", long_about = None)]
pub struct Cli {
    /// Lifecycle service JSON-RPC endpoint
    #[arg(long, env = "ESCROW_RPC_URL", default_value = "http://localhost:3030")]
    pub rpc_url: Url,

    /// Operator JSON-RPC endpoint, used by clear-fault and reconcile
    #[arg(long, env = "ESCROW_ADMIN_URL", default_value = "http://localhost:3031")]
    pub admin_url: Url,

    /// Identity the command is issued as
    #[arg(long = "as", env = "ESCROW_USER", global = true)]
    pub caller: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn caller(&self) -> Result<UserId> {
        self.caller
            .as_deref()
            .map(UserId::new)
            .ok_or_else(|| anyhow!("this command needs an identity, pass --as <user>"))
    }
}

#[derive(Clone, Subcommand)]
pub enum Command {
    /// Post a new job
    CreateJob(CreateJobArgs),
    /// Show a job with its bids
    Show { job_id: u64 },
    /// List jobs, newest first
    List(ListArgs),
    /// Show every bid on a job with its status
    Bids { job_id: u64 },
    /// Bid on an open job
    Bid(BidArgs),
    /// Select the winning bid
    Select { job_id: u64, bid_id: u64 },
    /// Lock the accepted amount in escrow
    Fund(WaitArgs),
    /// Submit the deliverable
    Submit { job_id: u64, content: String },
    /// Approve the deliverable and release payment
    Approve(WaitArgs),
    /// Ask the freelancer for changes
    Revise { job_id: u64, note: String },
    /// Freeze the job pending an out-of-band resolution
    Dispute { job_id: u64, reason: String },
    /// Unfreeze a job after operator review
    ClearFault { job_id: u64 },
    /// Reconcile one job against the ledger now
    Reconcile { job_id: u64 },
    /// Run a client and a few freelancers through the whole lifecycle
    Demo(DemoConfig),
}

#[derive(Clone, Args, Serialize)]
pub struct CreateJobArgs {
    #[arg(long)]
    pub title: String,

    #[arg(long, default_value = "")]
    pub description: String,

    /// Budget in ether, e.g. 1.5
    #[arg(long)]
    pub budget: String,

    /// Days from now until the deadline
    #[arg(long, default_value_t = 30)]
    pub deadline_days: u32,

    #[arg(long, default_value = "general")]
    pub category: String,

    /// Comma separated
    #[arg(long, value_delimiter = ',')]
    pub skills: Vec<String>,
}

#[derive(Clone, Args)]
pub struct ListArgs {
    /// Only jobs in these statuses, e.g. IN_ESCROW
    #[arg(long, value_delimiter = ',')]
    pub status: Vec<JobStatus>,

    #[arg(long)]
    pub client: Option<String>,

    /// Only jobs where this freelancer's bid was selected
    #[arg(long)]
    pub freelancer: Option<String>,
}

#[derive(Clone, Args)]
pub struct BidArgs {
    pub job_id: u64,

    /// Amount in ether
    #[arg(long)]
    pub amount: String,

    #[arg(long)]
    pub delivery_days: u32,

    /// Address the escrow pays out to
    #[arg(long)]
    pub payout: Address,

    #[arg(long, default_value = "")]
    pub proposal: String,
}

#[derive(Clone, Args)]
pub struct WaitArgs {
    pub job_id: u64,

    /// Keep polling until the ledger confirms
    #[arg(long, default_value_t = false)]
    pub wait: bool,

    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,
}

#[derive(Clone, Args, Serialize)]
pub struct DemoConfig {
    #[arg(long, env = "DEMO_CLIENT", default_value = "demo-client")]
    pub client: String,

    #[arg(long, env = "DEMO_FREELANCERS", default_value_t = 3)]
    pub freelancers: usize,

    /// Budget in ether
    #[arg(long, env = "DEMO_BUDGET", default_value = "2")]
    pub budget: String,

    /// How long to wait for each ledger confirmation
    #[arg(long, env = "DEMO_TIMEOUT", default_value_t = 120)]
    pub timeout_secs: u64,
}

pub fn ether(amount: &str) -> Result<U256> {
    parse_ether(amount).map_err(|e| anyhow!("invalid ether amount {:?}: {}", amount, e))
}
