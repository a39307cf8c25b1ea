use argh::FromArgs;
use infernum_client::{
    Callbacks, ClientConfig, HttpBackend, ImageFormat, InferenceBackend, QueryDefaults, RawImage,
};
use std::{path::PathBuf, sync::mpsc, time::Duration};

mod messages;

// defaults for the client
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(FromArgs)]
/// Infernum client for sending queries to an inference service
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "infernum_client::DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "image" or "json"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Image(ImageCommand),
    Json(JsonCommand),
}

#[derive(FromArgs)]
/// Send an image, already sized for the model
#[argh(subcommand, name = "image")]
struct ImageCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// encoding to send: "jpeg" or "png"
    #[argh(option, short = 'f', default = "ImageFormat::Jpeg")]
    format: ImageFormat,

    /// payload key holding the encoded image
    #[argh(option, short = 'k', default = "String::from(\"image\")")]
    key: String,
}

#[derive(FromArgs)]
/// Send a JSON payload as-is
#[argh(subcommand, name = "json")]
struct JsonCommand {
    /// the JSON payload
    #[argh(positional)]
    payload: String,
}

enum Outcome {
    Done,
    Failed(String),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ClientArgs = argh::from_env();

    let (done_tx, done_rx) = mpsc::channel();
    let error_tx = done_tx.clone();

    let callbacks = Callbacks::new()
        .on_info(|info| {
            match serde_json::from_value::<messages::InfoResponse>(info.clone()) {
                Ok(info) => println!(
                    "Model: {} (inputs: {:?}, outputs: {:?})",
                    info.model, info.inputs, info.outputs
                ),
                Err(_) => println!("Info: {}", serde_json::to_string_pretty(info)?),
            }
            Ok(())
        })
        .on_data(move |data| {
            match serde_json::from_value::<messages::QueryResponse>(data.clone()) {
                Ok(result) => println!("{} ({:.2})", result.class, result.confidence),
                Err(_) => println!("Result: {}", serde_json::to_string_pretty(data)?),
            }
            let _ = done_tx.send(Outcome::Done);
            Ok(())
        })
        .on_error(move |message| {
            let _ = error_tx.send(Outcome::Failed(message.to_string()));
            Ok(())
        });

    let config = ClientConfig::new(args.port)
        .with_host(args.host)
        .with_defaults(QueryDefaults::default())
        .with_request_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    let backend = HttpBackend::new(&config, callbacks)?;

    match args.command {
        ClientCommands::Image(command) => {
            let image = image::open(&command.image_path)?.to_rgb8();
            let (width, height) = image.dimensions();
            backend.query_image_as(
                &RawImage::rgb(image.as_raw(), width, height),
                command.format,
                &command.key,
            );
        }
        ClientCommands::Json(command) => {
            let payload: serde_json::Value = serde_json::from_str(&command.payload)?;
            backend.query_json(&payload);
        }
    }

    // wait for the first result or error
    match done_rx.recv_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS + 5))? {
        Outcome::Done => Ok(()),
        Outcome::Failed(message) => Err(message.into()),
    }
}
