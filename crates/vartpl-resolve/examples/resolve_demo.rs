use serde_json::json;
use tracing_subscriber::EnvFilter;
use vartpl_resolve::{batch_resolve, resolve_template, ResolutionContext};

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let ctx = ResolutionContext::from_json(json!({
        "services": { "api": { "url": "https://api.example.com", "port": 8080 } },
        "env": { "NODE_ENV": "production" }
    }))
    .unwrap();

    let result = resolve_template("${services.api.url}:${services.api.port} (${env.NODE_ENV})", &ctx);
    println!("{}", serde_json::to_string_pretty(&result).unwrap());

    let outcome = batch_resolve(
        [("API_URL", "${services.api.url}"), ("DB_HOST", "${services.db.host}"), ("MODE", "${env.NODE_ENV}")],
        &ctx,
        false,
    );
    println!("{}", serde_json::to_string_pretty(&outcome).unwrap());
}
