use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dpr::internal::{
    api::{ProposeRequest, RegisterProgramRequest, VoteRequest},
    identity::OrgSigner,
};
use reqwest::{Method, Url};
use std::fs;

#[derive(Parser)]
#[command(name = "dprctl")]
#[command(about = "Data processing registry CLI", long_about = None)]
struct Cli {
    /// Registry API base URL
    #[arg(long, env = "DPR_API", default_value = "http://localhost:7800", global = true)]
    api: String,

    /// Organization id to act as
    #[arg(long, env = "DPR_ORG", global = true)]
    org: Option<String>,

    /// File holding the organization's base64 keypair
    #[arg(long, env = "DPR_KEY_FILE", global = true)]
    key_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an organization keypair
    Keygen {
        /// Where to write the keypair
        #[arg(short, long)]
        out: String,
    },
    /// Build, verify and register a program
    Register {
        /// Program source file
        #[arg(short, long)]
        file: String,

        #[arg(long)]
        spid: String,

        #[arg(long)]
        linkable: bool,
    },
    /// Show a registered processing spec
    Spec { measurement: String },
    /// List registered processing specs
    List,
    /// Revoke a processing spec
    Revoke { measurement: String },
    /// Join library governance as the current organization
    Join,
    /// List governance participants
    Participants,
    /// Propose a library function
    Propose {
        #[arg(short, long)]
        name: String,

        /// File holding the function source
        #[arg(short, long)]
        file: String,
    },
    /// List proposals, or show one
    Proposals { name: Option<String> },
    /// Vote on a proposed function (approves unless --reject)
    Vote {
        name: String,

        #[arg(long)]
        reject: bool,
    },
    /// Print the approved library
    Library {
        /// Only functions accepted before this time (RFC 3339 or "YYYY-MM-DD HH:MM:SS")
        #[arg(long)]
        accepted_before: Option<String>,
    },
    /// Push the approved library to every build and verification node
    Propagate,
}

struct ApiClient {
    http: reqwest::Client,
    base: Url,
    signer: OrgSigner,
}

impl ApiClient {
    fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let org = cli.org.clone().context("--org (or DPR_ORG) is required")?;
        let key_file = cli
            .key_file
            .as_deref()
            .context("--key-file (or DPR_KEY_FILE) is required")?;
        let encoded = fs::read_to_string(key_file)
            .with_context(|| format!("reading key file {}", key_file))?;
        let signer = OrgSigner::from_base64(org, &encoded)?;
        Ok(Self {
            http: reqwest::Client::new(),
            base: Url::parse(&cli.api).context("invalid --api URL")?,
            signer,
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<String> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let signed_path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };

        let bytes = match &body {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };
        let headers = self.signer.sign_request(method.as_str(), &signed_path, &bytes);

        let mut request = self.http.request(method, url);
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }
        if body.is_some() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes);
        }

        let response = request.send().await.context("registry API unreachable")?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("registry API returned {}: {}", status, text);
        }
        Ok(text)
    }
}

fn print_json(text: &str) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Keygen { out } => keygen(cli.org.as_deref(), out),
        command => run(&cli, command).await,
    }
}

fn keygen(org: Option<&str>, out: &str) -> anyhow::Result<()> {
    let signer = OrgSigner::generate(org.unwrap_or("unnamed"));
    fs::write(out, signer.keypair_base64())?;
    println!("Keypair written to {}", out);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "id": signer.org(),
            "public_key": signer.public_key_base64(),
        }))?
    );
    Ok(())
}

async fn run(cli: &Cli, command: &Commands) -> anyhow::Result<()> {
    let client = ApiClient::from_cli(cli)?;

    match command {
        Commands::Keygen { out } => keygen(cli.org.as_deref(), out)?,
        Commands::Register {
            file,
            spid,
            linkable,
        } => {
            let source = fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
            let request = RegisterProgramRequest {
                source,
                spid: spid.clone(),
                linkable: *linkable,
            };
            let text = client
                .call(Method::POST, "/v1/programs", &[], Some(serde_json::to_value(request)?))
                .await?;
            print_json(&text)?;
        }
        Commands::Spec { measurement } => {
            let path = format!("/v1/programs/{}", measurement);
            print_json(&client.call(Method::GET, &path, &[], None).await?)?;
        }
        Commands::List => {
            print_json(&client.call(Method::GET, "/v1/programs", &[], None).await?)?;
        }
        Commands::Revoke { measurement } => {
            let path = format!("/v1/programs/{}", measurement);
            print_json(&client.call(Method::DELETE, &path, &[], None).await?)?;
        }
        Commands::Join => {
            print_json(&client.call(Method::POST, "/v1/participants", &[], None).await?)?;
        }
        Commands::Participants => {
            print_json(&client.call(Method::GET, "/v1/participants", &[], None).await?)?;
        }
        Commands::Propose { name, file } => {
            let source = fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
            let request = ProposeRequest {
                name: name.clone(),
                source,
            };
            let text = client
                .call(
                    Method::POST,
                    "/v1/library/proposals",
                    &[],
                    Some(serde_json::to_value(request)?),
                )
                .await?;
            print_json(&text)?;
        }
        Commands::Proposals { name } => {
            let path = match name {
                Some(name) => format!("/v1/library/proposals/{}", name),
                None => "/v1/library/proposals".to_string(),
            };
            print_json(&client.call(Method::GET, &path, &[], None).await?)?;
        }
        Commands::Vote { name, reject } => {
            let path = format!("/v1/library/proposals/{}/votes", name);
            let request = VoteRequest { approve: !reject };
            let text = client
                .call(Method::POST, &path, &[], Some(serde_json::to_value(request)?))
                .await?;
            print_json(&text)?;
        }
        Commands::Library { accepted_before } => {
            let query: Vec<(&str, &str)> = accepted_before
                .as_deref()
                .map(|cutoff| vec![("accepted_before", cutoff)])
                .unwrap_or_default();
            print!("{}", client.call(Method::GET, "/v1/library", &query, None).await?);
        }
        Commands::Propagate => {
            print_json(&client.call(Method::POST, "/v1/library/propagate", &[], None).await?)?;
        }
    }

    Ok(())
}
