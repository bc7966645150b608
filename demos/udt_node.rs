use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tracing::{info, warn, Level};
use udt_transport::config::{ResponseTimeout, TransportConfig};
use udt_transport::connection::{MessageInfo, Response, TransportCondition};
use udt_transport::transport::{MessageHandler, UdtTransport};

/// Listens for messages and answers each of them, or sends a single message to another node
///  and prints the answer.
#[derive(Parser)]
struct Args {
    address: String,

    #[clap(long)]
    send_to: Option<String>,

    #[clap(long, default_value = "hello")]
    message: String,

    #[clap(long, default_value_t = 5000)]
    response_timeout_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct EchoHandler {
    answer: bool,
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_message_received(&self, message: Vec<u8>, info: MessageInfo) -> Option<Response> {
        info!("received {:?} from {:?}", String::from_utf8_lossy(&message), info.remote_endpoint);
        if !self.answer {
            return None;
        }

        let mut payload = b"echo: ".to_vec();
        payload.extend_from_slice(&message);
        Some(Response {
            payload,
            timeout: ResponseTimeout::Immediate,
        })
    }

    fn on_error(&self, condition: TransportCondition) {
        warn!("transport error: {}", condition);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let self_addr: SocketAddr = args.address.parse()?;
    let config = TransportConfig::default_ipv4(self_addr);

    match args.send_to {
        Some(to) => {
            let to: SocketAddr = to.parse()?;
            let transport = UdtTransport::bind(config, Arc::new(EchoHandler { answer: false })).await?;

            let response_timeout = ResponseTimeout::After(Duration::from_millis(args.response_timeout_millis));
            transport.send(args.message.as_bytes(), to, response_timeout).await?;
        }
        None => {
            let transport = UdtTransport::bind(config, Arc::new(EchoHandler { answer: true })).await?;
            transport.start_listening()?;
            info!("listening on {:?}", transport.local_addr()?);

            tokio::signal::ctrl_c().await?;
            transport.shutdown();
        }
    }
    Ok(())
}
