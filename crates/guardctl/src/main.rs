use anyhow::Context;
use clap::Parser;
use serde_json::json;

/// guardctl is a CLI for interacting with an EnergyGuard API server.
#[derive(Debug, clap::Parser)]
#[clap(name = "guardctl")]
struct GuardCtl {
    /// Base URL of the EnergyGuard API.
    #[clap(long, env = "ENERGYGUARD_URL", default_value = "http://127.0.0.1:5000", global = true)]
    url: String,

    /// Bearer token for API authorization.
    #[clap(long, env = "ENERGYGUARD_TOKEN", default_value = "your_api_token_here", global = true)]
    token: String,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Subcommand {
    /// Ingest a measurement for a sensor at a timestamp
    Ingest {
        sensor_id: String,
        timestamp: String,
        value: String,
    },
    /// Fetch a measurement by its `<sensor_id>:<timestamp>` key
    Get { key: String },
    /// Delete a measurement by key
    Delete { key: String },
    /// Simulate failure of a storage node
    FailNode { node_id: u32 },
    /// Recover a previously failed storage node
    RecoverNode { node_id: u32 },
    /// Show the status of every storage node
    Status,
    /// Set the replication strategy (full | consistent)
    Configure {
        strategy: String,
        #[clap(long)]
        replication_factor: Option<usize>,
    },
    /// Show the nodes responsible for a key under consistent hashing
    Replicas { key: String },
    /// Set the anomaly threshold for a sensor
    SetThreshold { sensor_id: String, threshold: f64 },
    /// List alerts raised so far
    Alerts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let GuardCtl {
        url,
        token,
        subcommand,
    } = GuardCtl::parse();
    let client = Client {
        http: reqwest::Client::new(),
        url,
        token,
    };

    use Subcommand::*;
    let response = match subcommand {
        Ingest {
            sensor_id,
            timestamp,
            value,
        } => {
            client
                .post(
                    "ingest",
                    json!({"sensor_id": sensor_id, "timestamp": timestamp, "value": value}),
                )
                .await?
        }
        Get { key } => client.get(&format!("measurement/{key}")).await?,
        Delete { key } => client.delete(&format!("delete/{key}")).await?,
        FailNode { node_id } => {
            client
                .post(&format!("fail_node/{node_id}"), json!({}))
                .await?
        }
        RecoverNode { node_id } => {
            client
                .post(&format!("recover_node/{node_id}"), json!({}))
                .await?
        }
        Status => client.get("nodes_status").await?,
        Configure {
            strategy,
            replication_factor,
        } => {
            let mut body = json!({ "strategy": strategy });
            if let Some(factor) = replication_factor {
                body["replication_factor"] = factor.into();
            }
            client.post("configure_replication", body).await?
        }
        Replicas { key } => client.get(&format!("replica_nodes/{key}")).await?,
        SetThreshold {
            sensor_id,
            threshold,
        } => {
            client
                .post(
                    "set_threshold",
                    json!({"sensor_id": sensor_id, "threshold": threshold}),
                )
                .await?
        }
        Alerts => client.get("alerts").await?,
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

struct Client {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl Client {
    async fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let request = self.http.get(self.endpoint(path));
        self.send(request).await
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let request = self.http.post(self.endpoint(path)).json(&body);
        self.send(request).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let request = self.http.delete(self.endpoint(path));
        self.send(request).await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.url.trim_end_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .context("request failed")?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("decoding response body ({status})"))?;

        if !status.is_success() {
            anyhow::bail!(
                "server responded {status}: {}",
                serde_json::to_string_pretty(&body)?
            );
        }
        Ok(body)
    }
}
