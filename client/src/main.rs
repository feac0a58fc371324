use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    data::{Job, Part},
    payloads::*,
};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use std::{error::Error, fmt, time::Duration};
use tokio::time::sleep;
use url::Url;

#[allow(dead_code)] // the inner values are only there for Debug
#[derive(Clone, Debug)]
enum ClientError {
    ReqwestError(String),
    BadStatusCode(u16),
    JsonDecodeError(String),
    BadResponse(String),
    NotFound,
    Rejected(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReqwestError(s) => write!(f, "reqwest error: {s}"),
            Self::BadStatusCode(s) => write!(f, "bad status code {s}"),
            Self::JsonDecodeError(s) => write!(f, "json decode error: {s}"),
            Self::BadResponse(s) => write!(f, "bad response: {s}"),
            Self::NotFound => write!(f, "no such job"),
            Self::Rejected(s) => write!(f, "request rejected: {s}"),
        }
    }
}

impl Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        Self::ReqwestError(format!("{}", value))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        Self::JsonDecodeError(value.to_string())
    }
}

/// Errors the server will answer the same way no matter how often we ask.
fn is_final(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ClientError>(),
        Some(ClientError::NotFound | ClientError::Rejected(_))
    )
}

/// Runs a function returning Result in a loop with exponentional backoff.
/// Returns a successful response. Otherwise, bail!s.
macro_rules! try_something {
    ($a:expr) => {
        const MAX_TRIES: u8 = 7;
        for i in 0..MAX_TRIES {
            match $a {
                Ok(resp) => return Ok(resp),
                Err(e) if is_final(&e) => return Err(e),
                Err(e) => {
                    let to_sleep = 1 << i;
                    eprintln!("try {i} failed, sleeping {to_sleep}s: {e:?}");
                    sleep(Duration::from_secs(to_sleep)).await;
                }
            }
        }
        eprintln!("max tries reached; returning error");
        bail!("max tries reached");
    };
}

/// Turns a server body into the payload, or the error the server reported.
fn decode<Resp: DeserializeOwned + fmt::Debug>(
    status_code: u16,
    expected_status: u16,
    text: &str,
) -> Result<Resp> {
    let response: ErrorablePayload<Resp> = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(_) if status_code != expected_status => {
            bail!(ClientError::BadStatusCode(status_code))
        }
        Err(e) => bail!(ClientError::from(e)),
    };
    match response {
        ErrorablePayload::Ok(payload) if status_code == expected_status => Ok(payload),
        ErrorablePayload::Ok(_) => bail!(ClientError::BadStatusCode(status_code)),
        ErrorablePayload::NotFound => bail!(ClientError::NotFound),
        ErrorablePayload::Invalid(reason) => bail!(ClientError::Rejected(reason)),
        ErrorablePayload::Err(reason) => bail!(ClientError::BadResponse(reason)),
    }
}

struct Api {
    client: Client,
    base_url: Url,
}

impl Api {
    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Processes a response from the server.
    /// This involves checking the status code, decoding the body, etc.
    async fn process_response<Resp: DeserializeOwned + fmt::Debug>(
        input: reqwest::Result<reqwest::Response>,
        expected_status: u16,
    ) -> Result<Resp> {
        let res = input.map_err(ClientError::from)?;
        let status_code = res.status().as_u16();
        let text = res.text().await.map_err(ClientError::from)?;
        decode(status_code, expected_status, &text)
    }

    async fn request<Req: Serialize, Resp: DeserializeOwned + fmt::Debug>(
        &self,
        method: Method,
        url: &Url,
        payload: Option<&Req>,
        expected_status: u16,
    ) -> Result<Resp> {
        let mut builder = self.client.request(method, url.clone());
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }
        Self::process_response(builder.send().await, expected_status).await
    }

    async fn try_request<Req: Serialize, Resp: DeserializeOwned + fmt::Debug>(
        &self,
        method: Method,
        path: &str,
        payload: Option<Req>,
        expected_status: u16,
    ) -> Result<Resp> {
        let url = self.endpoint(path)?;
        try_something!(
            self.request(method.clone(), &url, payload.as_ref(), expected_status)
                .await
        );
    }

    async fn list(&self) -> Result<Vec<Job>> {
        self.try_request::<(), _>(Method::GET, "jobs", None, 200).await
    }

    async fn create(&self, uri: String) -> Result<JobInformation> {
        self.try_request(Method::POST, "jobs", Some(JobCreationPayload { uri }), 201)
            .await
    }

    async fn show(&self, id: &str) -> Result<Job> {
        self.try_request::<(), _>(Method::GET, &format!("jobs/{id}"), None, 200)
            .await
    }

    async fn parts(&self, id: &str) -> Result<Vec<Part>> {
        self.try_request::<(), _>(Method::GET, &format!("jobs/{id}/parts"), None, 200)
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.try_request::<(), _>(Method::DELETE, &format!("jobs/{id}"), None, 200)
            .await
    }
}

fn job_line(job: &Job) -> String {
    format!(
        "{}  {:<16} {:<10} {}",
        job.id, job.stage, job.status, job.source_uri
    )
}

fn part_line(part: &Part) -> String {
    let last = part.log.last().map(|e| e.message.as_str()).unwrap_or("");
    format!("{:>5}  {:<11} {:<28} {}", part.id, part.status, part.range, last)
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List every job
    List,
    /// Queue a remote path for archiving
    Create { uri: String },
    /// Print one job as JSON
    Show { id: String },
    /// List the upload parts of a job
    Parts { id: String },
    /// Forget a job and its parts
    Delete { id: String },
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, default_value = "http://localhost:8886/")]
    pub base_url: Url,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::builder()
        .user_agent("offsite-client/0.1")
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .build()?;
    let api = Api {
        client,
        base_url: args.base_url,
    };

    match args.command {
        Command::List => {
            for job in api.list().await? {
                println!("{}", job_line(&job));
            }
        }
        Command::Create { uri } => {
            let info = api.create(uri).await?;
            println!("{}", info.id);
        }
        Command::Show { id } => {
            let job = api.show(&id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Parts { id } => {
            for part in api.parts(&id).await? {
                println!("{}", part_line(&part));
            }
        }
        Command::Delete { id } => {
            api.delete(&id).await?;
            eprintln!("Deleted {id}.");
        }
    }
    Ok(())
}
