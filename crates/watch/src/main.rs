//! framejob-watch
//!
//! Command line watcher for a running framejob server: lists the queue,
//! streams events and sends queue commands over the control port.

use clap::{Parser, Subcommand};
use framejob::control_client::{server_url, ControlClient};
use framejob::events::ServerEvent;
use framejob::jobs::JobProperties;
use framejob::protocol::{ClientRequest, ServerReply, DEFAULT_PORT};
use std::path::PathBuf;
use std::process::ExitCode;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "framejob-watch")]
#[command(author, version, about = "Watch and control a framejob server", long_about = None)]
struct Args {
    /// Control server URL
    #[arg(long, default_value_t = server_url("127.0.0.1", DEFAULT_PORT))]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the job queue
    Jobs,
    /// Print the queue, then stream events until interrupted
    Watch,
    /// Queue a job described by a JSON file
    Create { file: PathBuf },
    /// Start waiting jobs
    Start,
    /// Pause the running job
    Pause,
    /// Resume paused jobs
    Resume,
    /// Abort active jobs
    Abort,
    /// Reset jobs to waiting
    Reset { ids: Vec<Uuid> },
    /// Remove jobs from the queue
    Delete { ids: Vec<Uuid> },
    /// Swap two jobs' queue positions
    Swap { first: Uuid, second: Uuid },
    /// Ask the server to show its window
    Show,
    /// Ask the server to exit
    CloseServer,
    /// Measure the round trip to the server
    Ping,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = ControlClient::connect(&args.url).await?;

    let request = match args.command {
        Command::Jobs => {
            print_jobs(&mut client).await?;
            return Ok(());
        }
        Command::Watch => {
            client.request(&ClientRequest::Subscribe).await?;
            print_jobs(&mut client).await?;
            loop {
                tokio::select! {
                    event = client.next_event() => {
                        let event = event?;
                        println!("{}", serde_json::to_string(&event)?);
                        if event == ServerEvent::ServerClosing {
                            return Ok(());
                        }
                    }
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
        Command::Ping => {
            let elapsed = client.ping().await?;
            println!("pong in {:.1} ms", elapsed.as_secs_f64() * 1000.0);
            return Ok(());
        }
        Command::Create { file } => {
            let job: JobProperties = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            ClientRequest::CreateJob { job }
        }
        Command::Start => ClientRequest::StartWaitingJobs,
        Command::Pause => ClientRequest::PauseActiveJobs,
        Command::Resume => ClientRequest::ResumePausedJobs,
        Command::Abort => ClientRequest::AbortActiveJobs,
        Command::Reset { ids } => ClientRequest::ResetJobs { ids },
        Command::Delete { ids } => ClientRequest::DeleteJobs { ids },
        Command::Swap { first, second } => ClientRequest::SwapJobs { first, second },
        Command::Show => ClientRequest::ShowWindow,
        Command::CloseServer => ClientRequest::CloseServer,
    };

    match client.request(&request).await? {
        ServerReply::Created { job } => println!("created {}", job.id),
        ServerReply::Ok { command } => println!("ok: {}", command),
        ServerReply::Error { reason } => return Err(reason.into()),
        other => println!("{}", serde_json::to_string(&other)?),
    }
    client.close().await?;
    Ok(())
}

async fn print_jobs(client: &mut ControlClient) -> Result<(), Box<dyn std::error::Error>> {
    let ServerReply::JobsInfo { jobs } = client.request(&ClientRequest::GetJobsInfo).await? else {
        return Err("unexpected reply to get-jobs-info".into());
    };
    if jobs.is_empty() {
        println!("(no jobs)");
    }
    for (index, job) in jobs.iter().enumerate() {
        println!(
            "{:>3}  {}  {:<18} {:<20} {}/{}",
            index,
            job.id,
            job.job_state,
            job.job_type,
            job.frames_processed,
            job.frames_total
        );
    }
    Ok(())
}
