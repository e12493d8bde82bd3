use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use escrow_api::{
    rpc::{AdminApiClient, LifecycleApiClient},
    types::CreateJobRequest,
};
use escrow_cli::{
    cli::{ether, Cli, Command},
    demo::{run_demo, settle},
    env::init_console_subscriber,
};
use jsonrpsee::http_client::HttpClientBuilder;
use lifecycle::{BidId, JobFilter, JobId, NewBid, UserId};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_console_subscriber();
    let cli = Cli::parse();
    let client = HttpClientBuilder::default().build(cli.rpc_url.as_str())?;

    match cli.command.clone() {
        Command::CreateJob(args) => {
            let request = CreateJobRequest {
                title: args.title,
                description: args.description,
                budget: ether(&args.budget)?,
                deadline: Utc::now() + ChronoDuration::days(args.deadline_days.into()),
                category: args.category,
                skills: args.skills,
            };
            print_json(&client.create_job(cli.caller()?, request).await?)
        }
        Command::Show { job_id } => print_json(&client.get_job(JobId(job_id)).await?),
        Command::List(args) => {
            let filter = JobFilter {
                statuses: args.status,
                client_id: args.client.map(UserId::new),
                freelancer_id: args.freelancer.map(UserId::new),
            };
            print_json(&client.list_jobs(filter).await?)
        }
        Command::Bids { job_id } => print_json(&client.bid_statuses(JobId(job_id)).await?),
        Command::Bid(args) => {
            let bid = NewBid {
                payout_address: args.payout,
                amount: ether(&args.amount)?,
                delivery_days: args.delivery_days,
                proposal: args.proposal,
            };
            print_json(&client.submit_bid(cli.caller()?, JobId(args.job_id), bid).await?)
        }
        Command::Select { job_id, bid_id } => print_json(
            &client
                .select_bid(cli.caller()?, JobId(job_id), BidId(bid_id))
                .await?,
        ),
        Command::Fund(args) => {
            let response = client.fund_escrow(cli.caller()?, JobId(args.job_id)).await?;
            if args.wait {
                let timeout = Duration::from_secs(args.timeout_secs);
                print_json(&settle(&client, response, timeout).await?)
            } else {
                print_json(&response)
            }
        }
        Command::Submit { job_id, content } => print_json(
            &client
                .submit_work(cli.caller()?, JobId(job_id), content)
                .await?,
        ),
        Command::Approve(args) => {
            let response = client.approve_work(cli.caller()?, JobId(args.job_id)).await?;
            if args.wait {
                let timeout = Duration::from_secs(args.timeout_secs);
                print_json(&settle(&client, response, timeout).await?)
            } else {
                print_json(&response)
            }
        }
        Command::Revise { job_id, note } => print_json(
            &client
                .request_revision(cli.caller()?, JobId(job_id), note)
                .await?,
        ),
        Command::Dispute { job_id, reason } => print_json(
            &client
                .raise_dispute(cli.caller()?, JobId(job_id), reason)
                .await?,
        ),
        Command::ClearFault { job_id } => {
            let admin = HttpClientBuilder::default().build(cli.admin_url.as_str())?;
            print_json(&admin.clear_integrity_fault(JobId(job_id)).await?)
        }
        Command::Reconcile { job_id } => {
            let admin = HttpClientBuilder::default().build(cli.admin_url.as_str())?;
            print_json(&admin.reconcile_job(JobId(job_id)).await?)
        }
        Command::Demo(config) => {
            info!("{}", serde_json::to_string_pretty(&config)?);
            let job = run_demo(&client, config).await?;
            print_json(&job)
        }
    }
}
