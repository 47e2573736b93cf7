use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";

#[derive(Parser, Debug)]
#[command(name = "mugshot", about = "Mugshot face identity CLI")]
struct Cli {
    /// Base URL of the mugshotd server
    #[arg(long, global = true, env = "MUGSHOT_SERVER", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enroll a person from face images (one face per image)
    Enroll {
        username: String,
        /// Image files, in order; the server expects a fixed number
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize every face in an image
    Recognize { image: PathBuf },
    /// List enrolled usernames
    List,
    /// Show daemon status
    Status,
    /// Fetch the stored face thumbnail of an enrolled user
    Thumbnail {
        username: String,
        /// Write the decoded JPEG here instead of printing base64
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
struct Recognition {
    name: String,
    probability: f64,
}

#[derive(Debug, Deserialize)]
struct Users {
    users: Vec<String>,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct Registered {
    message: String,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredImage {
    stored_image: String,
}

struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: server.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn enroll(&self, username: &str, images: &[PathBuf]) -> Result<Registered> {
        let mut form = multipart::Form::new().text("username", username.to_string());
        for (i, path) in images.iter().enumerate() {
            form = form.part(format!("image{i}"), file_part(path)?);
        }
        let response = self.http.post(self.url("/register")).multipart(form).send().await?;
        decode(response).await
    }

    async fn recognize(&self, image: &Path) -> Result<Vec<Recognition>> {
        let form = multipart::Form::new().part("image", file_part(image)?);
        let response = self
            .http
            .post(self.url("/recognize-multi"))
            .multipart(form)
            .send()
            .await?;
        decode(response).await
    }

    async fn users(&self) -> Result<Users> {
        decode(self.http.get(self.url("/get_users")).send().await?).await
    }

    async fn status(&self) -> Result<serde_json::Value> {
        decode(self.http.get(self.url("/status")).send().await?).await
    }

    /// `/users/{username}/images` with the username percent-encoded as one path segment.
    fn user_images_url(&self, username: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("invalid server URL {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("server URL {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(["users", username, "images"]);
        Ok(url)
    }

    async fn thumbnail(&self, username: &str) -> Result<StoredImage> {
        let url = self.user_images_url(username)?;
        decode(self.http.get(url).send().await?).await
    }
}

fn file_part(path: &Path) -> Result<multipart::Part> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(multipart::Part::bytes(bytes).file_name(file_name))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        bail!("server returned {status}: {}", error_message(&body));
    }
    serde_json::from_slice(&body).context("unexpected response from server")
}

/// The `error` field of a JSON error body, or the raw body.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

fn format_recognition(results: &[Recognition]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("face {i}: {} ({:.4})", r.name, r.probability))
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);
    tracing::debug!(server = %client.base_url, "using server");

    match cli.command {
        Commands::Enroll { username, images } => {
            let registered = client.enroll(&username, &images).await?;
            match registered.id {
                Some(id) => println!("{} (id {id})", registered.message),
                None => println!("{}", registered.message),
            }
        }
        Commands::Recognize { image } => {
            let results = client.recognize(&image).await?;
            if results.is_empty() {
                println!("No faces found");
            } else {
                println!("{}", format_recognition(&results));
            }
        }
        Commands::List => {
            let users = client.users().await?;
            for user in &users.users {
                println!("{user}");
            }
            println!("{} enrolled", users.count);
        }
        Commands::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Thumbnail { username, output } => {
            let stored = client.thumbnail(&username).await?;
            match output {
                Some(path) => {
                    let jpeg = base64::engine::general_purpose::STANDARD
                        .decode(stored.stored_image.as_bytes())
                        .context("server returned a thumbnail that is not base64")?;
                    std::fs::write(&path, jpeg)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => println!("{}", stored.stored_image),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from(["mugshot", "enroll", "alice", "a.jpg", "b.jpg"]).unwrap();
        match cli.command {
            Commands::Enroll { username, images } => {
                assert_eq!(username, "alice");
                assert_eq!(images, vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_enroll_needs_images() {
        assert!(Cli::try_parse_from(["mugshot", "enroll", "alice"]).is_err());
    }

    #[test]
    fn test_server_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["mugshot", "list", "--server", "http://faces:8080/"]).unwrap();
        assert_eq!(cli.server, "http://faces:8080/");
        assert_eq!(Client::new(&cli.server).url("/get_users"), "http://faces:8080/get_users");
    }

    #[test]
    fn test_parse_thumbnail() {
        let cli = Cli::try_parse_from(["mugshot", "thumbnail", "alice", "-o", "alice.jpg"]).unwrap();
        match cli.command {
            Commands::Thumbnail { username, output } => {
                assert_eq!(username, "alice");
                assert_eq!(output, Some(PathBuf::from("alice.jpg")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_user_images_url_encodes_username() {
        let client = Client::new("http://faces:8080/");
        assert_eq!(
            client.user_images_url("alice").unwrap().as_str(),
            "http://faces:8080/users/alice/images"
        );
        assert_eq!(
            client.user_images_url("ann marie/x").unwrap().as_str(),
            "http://faces:8080/users/ann%20marie%2Fx/images"
        );
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(br#"{"error": "No face detected in image 3"}"#),
            "No face detected in image 3"
        );
        assert_eq!(error_message(b"Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_format_recognition() {
        let results = vec![
            Recognition {
                name: "alice".into(),
                probability: 0.91234,
            },
            Recognition {
                name: "Unknown".into(),
                probability: 0.2,
            },
        ];
        assert_eq!(
            format_recognition(&results),
            "face 0: alice (0.9123)\nface 1: Unknown (0.2000)"
        );
    }

    #[test]
    fn test_file_part_missing_file() {
        let err = file_part(Path::new("/nonexistent/face.jpg")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/face.jpg"));
    }
}
