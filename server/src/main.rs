use std::{io, path::PathBuf, sync::Arc};

use actix_web::{delete, get, post, web, App, HttpResponse, HttpServer, Responder};
use clap::Parser;

use common::db::*;
mod payloads;
use payloads::*;
mod config;
mod error;
mod files;
mod gateway;
mod pipeline;
mod reconcile;
mod scheduler;
#[cfg(test)]
mod testing;
mod vault;

use config::Config;
use gateway::SshGateway;
use pipeline::{Pipeline, PipelineSettings};
use reconcile::Reconciler;
use scheduler::{ProcessEpoch, SchedulerSettings, UploadScheduler};
use vault::DirectoryVault;

#[get("/")]
async fn slash() -> impl Responder {
    HttpResponse::Ok().body("the archivists are coming for your files")
}

type JobListResp = ErrorablePayload<JobListResponse>;

#[get("/jobs")]
async fn list_jobs(ctx: web::Data<SharedCtx>) -> impl Responder {
    match ctx.db.list_jobs().await {
        Ok(jobs) => JobListResp::Ok(jobs),
        Err(e) => JobListResp::from(e),
    }
    .to_response(HttpResponse::Ok())
}

type NewJobResp = ErrorablePayload<NewJobResponse>;

#[post("/jobs")]
async fn new_job(
    ctx: web::Data<SharedCtx>,
    details: web::Json<JobCreationPayload>,
) -> impl Responder {
    let uri = details.into_inner().uri;
    if uri.trim().is_empty() {
        return NewJobResp::Invalid("uri must not be empty".to_string())
            .to_response(HttpResponse::Created());
    }
    let job = Job::new(uuid::Uuid::now_v7().to_string(), uri);
    match ctx.db.put_job(&job).await {
        Ok(()) => {
            log::info!("job {} created for {}", job.id, job.source_uri);
            NewJobResp::Ok(JobInformation { id: job.id })
        }
        Err(e) => NewJobResp::from(e),
    }
    .to_response(HttpResponse::Created())
}

type GetJobResp = ErrorablePayload<SingleJobResponse>;

#[get("/jobs/{id}")]
async fn get_job(ctx: web::Data<SharedCtx>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match ctx.db.get_job(&id).await {
        Ok(job) => GetJobResp::Ok(job),
        Err(e) => GetJobResp::from(e),
    }
    .to_response(HttpResponse::Ok())
}

type PartListResp = ErrorablePayload<PartListResponse>;

#[get("/jobs/{id}/parts")]
async fn get_parts(ctx: web::Data<SharedCtx>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    if let Err(e) = ctx.db.get_job(&id).await {
        return PartListResp::from(e).to_response(HttpResponse::Ok());
    }
    match ctx.db.list_parts(&id).await {
        Ok(parts) => PartListResp::Ok(parts),
        Err(e) => PartListResp::from(e),
    }
    .to_response(HttpResponse::Ok())
}

type DeleteJobResp = ErrorablePayload<DeleteJobResponse>;

#[delete("/jobs/{id}")]
async fn delete_job(ctx: web::Data<SharedCtx>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match ctx.db.delete_job(&id).await {
        Ok(()) => {
            log::info!("job {id} deleted");
            DeleteJobResp::Ok(())
        }
        Err(e) => DeleteJobResp::from(e),
    }
    .to_response(HttpResponse::Ok())
}

struct SharedCtx {
    db: Database,
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(slash)
        .service(list_jobs)
        .service(new_job)
        .service(get_job)
        .service(get_parts)
        .service(delete_job);
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 8886)]
    pub port: u16,

    /// Defaults to ~/.config/offsite-archive-tool/offsite-archive-tool.json
    #[arg(short, long)]
    pub configuration: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config_path = args
        .configuration
        .unwrap_or_else(config::default_config_path);
    let config = Config::load(&config_path).map_err(io::Error::other)?;
    log::info!("loaded configuration from {}", config_path.display());
    std::fs::create_dir_all(&config.working_directory)?;
    let db = Database::open(&config.database_path()).map_err(io::Error::other)?;

    let epoch = ProcessEpoch::new();
    log::info!("process epoch {}", epoch.as_str());
    let repo: Arc<dyn Repository> = Arc::new(db.clone());
    let scheduler = UploadScheduler::new(
        Arc::clone(&repo),
        Arc::new(DirectoryVault::new(config.vault.root.clone())),
        epoch,
        SchedulerSettings {
            vault_name: config.vault.name.clone(),
            max_uploading_parts: config.max_uploading_parts,
            retry_cooldown_secs: config.part_retry_cooldown_secs,
        },
    );
    let pipeline = Pipeline::new(
        Arc::clone(&repo),
        Arc::new(SshGateway::new(config.ssh.clone())),
        scheduler,
        PipelineSettings {
            working_directory: config.working_directory.clone(),
            ssh: config.ssh.clone(),
        },
    );
    let reconciler = Reconciler::new(repo, Arc::new(pipeline));
    actix_web::rt::spawn(reconciler.run(config.tick_interval()));

    HttpServer::new(move || {
        let ctx = SharedCtx { db: db.clone() };
        App::new().app_data(web::Data::new(ctx)).configure(routes)
    })
    .bind(("127.0.0.1", args.port))?
    .run()
    .await
}
