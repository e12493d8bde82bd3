use crate::cli::{ether, DemoConfig};
use alloy::primitives::{utils::format_ether, Address, U256};
use anyhow::{anyhow, bail, Result};
use chrono::{Duration as ChronoDuration, Utc};
use escrow_api::{
    rpc::LifecycleApiClient,
    types::{CommandResponse, CommandStatus, CreateJobRequest},
};
use jsonrpsee::http_client::HttpClient;
use lifecycle::{Job, JobId, JobStatus, NewBid, UserId};
use proptest::{
    prelude::*,
    strategy::{Strategy, ValueTree},
    test_runner::TestRunner,
};
use std::time::Duration;
use tracing::info;

/// Poll the job until no ledger operation is in flight.
pub async fn poll_until_settled(client: &HttpClient, job_id: JobId) -> Result<Job> {
    loop {
        let job = client.get_job(job_id).await?;
        match &job.pending_ledger_op {
            None => return Ok(job),
            Some(intent) => {
                info!(%job_id, op = %intent.op, "ledger not confirmed yet, waiting 2 seconds");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Resolve a possibly pending command response into the settled job.
pub async fn settle(
    client: &HttpClient,
    response: CommandResponse,
    timeout: Duration,
) -> Result<Job> {
    match response.status {
        CommandStatus::Committed => Ok(response.job),
        CommandStatus::Pending => {
            tokio::time::timeout(timeout, poll_until_settled(client, response.job.id))
                .await
                .map_err(|_| anyhow!("job {} still pending after {:?}", response.job.id, timeout))?
        }
    }
}

fn bid_strategy(max_tenths: u64) -> impl Strategy<Value = NewBid> {
    (
        1..=max_tenths.max(1),
        1u32..=30,
        any::<[u8; 20]>().prop_filter("payout must be non-zero", |b| b.iter().any(|x| *x != 0)),
    )
        .prop_map(|(tenths, delivery_days, payout)| NewBid {
            payout_address: Address::from(payout),
            amount: U256::from(tenths) * U256::from(100_000_000_000_000_000u64),
            delivery_days,
            proposal: format!("can deliver in {} days", delivery_days),
        })
}

fn generate_bids(n: usize, budget: U256) -> Result<Vec<NewBid>> {
    let max_tenths = (budget / U256::from(100_000_000_000_000_000u64)).saturating_to::<u64>();
    let mut runner = TestRunner::default();
    let tree = prop::collection::vec(bid_strategy(max_tenths), n)
        .new_tree(&mut runner)
        .map_err(|e| anyhow!("failed to generate bids: {}", e))?;
    Ok(tree.current())
}

/// The cheapest bid wins, earliest delivery breaks ties.
fn pick_winner(job: &Job) -> Option<&lifecycle::Bid> {
    job.bids
        .iter()
        .min_by_key(|b| (b.amount, b.delivery_days))
}

pub async fn run_demo(client: &HttpClient, config: DemoConfig) -> Result<Job> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let owner = UserId::new(config.client.as_str());
    let budget = ether(&config.budget)?;

    let job = client
        .create_job(
            owner.clone(),
            CreateJobRequest {
                title: "Demo job".into(),
                description: "Walk a job from posting to payout".into(),
                budget,
                deadline: Utc::now() + ChronoDuration::days(7),
                category: "demo".into(),
                skills: vec!["rust".into()],
            },
        )
        .await?;
    info!(job_id = %job.id, budget = %format_ether(budget), "job posted");

    let bids = generate_bids(config.freelancers, budget)?;
    let mut job = job;
    for (i, bid) in bids.into_iter().enumerate() {
        let freelancer = UserId::new(format!("demo-freelancer-{}", i + 1));
        info!(%freelancer, amount = %format_ether(bid.amount), "submitting bid");
        job = client.submit_bid(freelancer, job.id, bid).await?;
    }

    let (bid_id, freelancer) = pick_winner(&job)
        .map(|b| (b.id, b.freelancer_id.clone()))
        .ok_or_else(|| anyhow!("no bids were placed on job {}", job.id))?;
    client.select_bid(owner.clone(), job.id, bid_id).await?;
    info!(%bid_id, %freelancer, "bid selected");

    info!("Funding escrow");
    let funded = settle(client, client.fund_escrow(owner.clone(), job.id).await?, timeout).await?;
    if funded.status != JobStatus::InEscrow {
        bail!("escrow funding did not settle, job is {}", funded.status);
    }
    info!(tx = ?funded.escrow_tx_ref, "escrow funded");

    client
        .submit_work(freelancer.clone(), job.id, "first draft".into())
        .await?;
    client
        .request_revision(owner.clone(), job.id, "please add tests".into())
        .await?;
    info!("Revision requested, resubmitting");
    client
        .submit_work(freelancer.clone(), job.id, "final version with tests".into())
        .await?;

    info!("Approving work and releasing payment");
    let done = settle(client, client.approve_work(owner, job.id).await?, timeout).await?;
    if done.status != JobStatus::Complete {
        bail!("payment release did not settle, job is {}", done.status);
    }
    info!(tx = ?done.completion_tx_ref, "payment released, job complete");
    Ok(done)
}
