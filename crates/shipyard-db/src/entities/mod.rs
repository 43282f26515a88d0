pub mod app_domains;
pub mod apps;
pub mod deploy_jobs;
