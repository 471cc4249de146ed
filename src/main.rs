//! `bacnet-proxy-ip`: inspect and correct the BACnet/IP proxy address of
//! field controllers.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use bacnet_proxy_ip::client::{device_object, BacnetIpClient, ClientError, ProtocolStack};
use bacnet_proxy_ip::config::{CheckerConfig, ConfigError};
use bacnet_proxy_ip::encoding::{self, ApplicationTag, Tag, TagList};
use bacnet_proxy_ip::object::{parse_object_type, ObjectIdentifier, ObjectType, PropertyIdentifier};
use bacnet_proxy_ip::resolver::{FixedAddress, PublicAddressResolver, ResolverError};
use bacnet_proxy_ip::service::{
    ReadPropertyRequest, ReinitializeDeviceRequest, ReinitializedState, WritePropertyRequest,
};
use bacnet_proxy_ip::settings::{self, SettingsError, SettingsPatch, SettingsRecord};
use bacnet_proxy_ip::transport::ForeignDevice;
use bacnet_proxy_ip::util::{hex_dump, parse_device_address, parse_ipv4};
use bacnet_proxy_ip::workflow::{CorrectionWorkflow, FailureReason, Session, Target};

/// Proprietary device property that commits settings to flash
const SAVE_SETTINGS_PROPERTY: u32 = 1151;

#[derive(Debug, Parser)]
#[command(name = "bacnet-proxy-ip", version, about)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// TOML configuration file
    #[arg(long, global = true, env = "BACNET_PROXY_IP_CONFIG")]
    config: Option<PathBuf>,

    /// Local address to bind
    #[arg(long, global = true)]
    bind: Option<SocketAddr>,

    /// Register as a foreign device with this BBMD
    #[arg(long, global = true, value_parser = device_address)]
    bbmd: Option<SocketAddr>,

    /// Foreign device time-to-live in seconds
    #[arg(long, global = true, requires = "bbmd")]
    ttl: Option<u16>,

    /// More output (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less output (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,
}

#[derive(Debug, Args)]
struct PropertyArgs {
    /// Device address, `a.b.c.d[:port]`
    #[arg(value_parser = device_address)]
    address: SocketAddr,
    /// Object type, by name or number
    #[arg(value_parser = parse_object_type)]
    object_type: ObjectType,
    instance: u32,
    /// Property, by name or number
    property: PropertyIdentifier,
    /// Array index
    index: Option<u32>,
}

impl PropertyArgs {
    fn object(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(self.object_type, self.instance)
    }

    fn read_request(&self) -> ReadPropertyRequest {
        let request = ReadPropertyRequest::new(self.object(), self.property);
        match self.index {
            Some(index) => request.with_array_index(index),
            None => request,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read a property and dump its tag stream
    Read {
        #[command(flatten)]
        target: PropertyArgs,
    },
    /// Rewrite the proxy address held in a settings property
    Write {
        #[command(flatten)]
        target: PropertyArgs,
        /// New proxy address; the public address when omitted
        #[arg(value_parser = ipv4_address)]
        ipv4: Option<Ipv4Addr>,
    },
    /// Restart a device
    Reinit {
        #[arg(value_parser = device_address)]
        address: SocketAddr,
        /// coldstart, warmstart, ... or the state number
        state: ReinitializedState,
        #[arg(long)]
        password: Option<String>,
    },
    /// Discover devices
    Whois {
        /// Unicast to this address instead of broadcasting
        #[arg(value_parser = device_address)]
        address: Option<SocketAddr>,
        low: Option<u32>,
        #[arg(requires = "low")]
        high: Option<u32>,
    },
    /// Commit a device's settings to flash
    Save {
        #[arg(value_parser = device_address)]
        address: SocketAddr,
        device_instance: u32,
    },
    /// Run the full proxy address correction
    Check {
        /// Device instance to correct
        #[arg(long)]
        device: Option<u32>,
        /// Device address
        #[arg(long, value_parser = device_address)]
        address: Option<SocketAddr>,
        /// Lowest device instance to accept
        #[arg(long, conflicts_with = "device")]
        low: Option<u32>,
        /// Highest device instance to accept
        #[arg(long, requires = "low")]
        high: Option<u32>,
        /// Use this public address instead of looking it up
        #[arg(long = "public-ip")]
        public_ip: Option<String>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Failed(#[from] FailureReason),
    #[error("{0}")]
    Usage(String),
}

fn device_address(text: &str) -> Result<SocketAddr, String> {
    parse_device_address(text).ok_or_else(|| format!("not a BACnet/IP address: {text:?}"))
}

fn ipv4_address(text: &str) -> Result<Ipv4Addr, String> {
    parse_ipv4(text).ok_or_else(|| format!("not an IPv4 address: {text:?}"))
}

fn init_logging(global: &GlobalOpts) {
    let level = match i16::from(global.verbose) - i16::from(global.quiet) {
        i16::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn load_config(global: &GlobalOpts) -> Result<CheckerConfig, CliError> {
    let mut config = match &global.config {
        Some(path) => CheckerConfig::load(path)?,
        None => CheckerConfig::default(),
    };
    if let Some(bind) = global.bind {
        config.network.bind = bind;
    }
    if let Some(bbmd) = global.bbmd {
        let ttl = global
            .ttl
            .or(config.network.foreign_device.map(|fd| fd.ttl))
            .unwrap_or(bacnet_proxy_ip::transport::constants::DEFAULT_FD_TTL);
        config.network.foreign_device = Some(ForeignDevice { bbmd, ttl });
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "http-resolver")]
fn lookup_resolver(config: &CheckerConfig) -> Result<bacnet_proxy_ip::resolver::JsonIpResolver, CliError> {
    let timeout = config.session().resolver_timeout;
    Ok(bacnet_proxy_ip::resolver::JsonIpResolver::new(
        config.resolver.url.clone(),
        timeout,
    )?)
}

async fn public_address(config: &CheckerConfig) -> Result<Ipv4Addr, CliError> {
    #[cfg(feature = "http-resolver")]
    {
        let text = lookup_resolver(config)?.resolve().await?;
        parse_ipv4(text.trim()).ok_or(CliError::Failed(FailureReason::InvalidAddress(text)))
    }
    #[cfg(not(feature = "http-resolver"))]
    {
        let _ = config;
        Err(CliError::Usage(
            "built without the HTTP resolver; pass the address explicitly".into(),
        ))
    }
}

fn print_tags(tags: &TagList) -> Result<(), CliError> {
    let raw = encoding::serialize(tags).map_err(SettingsError::from)?;
    println!("{} octets: {}", raw.len(), hex_dump(&raw));
    let mut depth = 0usize;
    for tag in tags {
        if matches!(tag, Tag::Closing { .. }) {
            depth = depth.saturating_sub(1);
        }
        println!("{:indent$}{}", "", describe(tag), indent = depth * 2);
        if matches!(tag, Tag::Opening { .. }) {
            depth += 1;
        }
    }
    Ok(())
}

fn describe(tag: &Tag) -> String {
    match tag {
        Tag::Opening { context } => format!("[{}] {{", context),
        Tag::Closing { context } => format!("}} [{}]", context),
        Tag::Context { context, data } => format!("[{}] {}", context, hex::encode(data)),
        Tag::Application { tag, data } => {
            let name = ApplicationTag::try_from(*tag)
                .map(|t| format!("{:?}", t))
                .unwrap_or_else(|_| format!("application {}", tag));
            format!("{} {}", name, hex::encode(data))
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli.global)?;

    if let Command::Check {
        device,
        address,
        low,
        high,
        public_ip,
    } = &cli.command
    {
        let mut target = config.target();
        target.device_instance = device.or(target.device_instance);
        target.address = address.or(target.address);
        if let Some(low) = *low {
            let high = high.unwrap_or(low);
            if low > high {
                return Err(CliError::Usage(format!("device range {}..={} is empty", low, high)));
            }
            target.device_instance = None;
            target.range = Some((low, high));
        }
        let client = BacnetIpClient::bind(config.transport(), config.client_timeouts()).await?;
        return match public_ip {
            Some(ip) => check(client, FixedAddress::new(ip.clone()), &config, target).await,
            #[cfg(feature = "http-resolver")]
            None => check(client, lookup_resolver(&config)?, &config, target).await,
            #[cfg(not(feature = "http-resolver"))]
            None => Err(CliError::Usage(
                "built without the HTTP resolver; pass --public-ip".into(),
            )),
        };
    }

    let client = BacnetIpClient::bind(config.transport(), config.client_timeouts()).await?;
    match cli.command {
        Command::Read { target } => {
            let ack = client.read_property(target.address, &target.read_request()).await?;
            print_tags(&ack.value)?;
            if let Some(model) = settings::infer_model(target.object_type, target.property) {
                let record = SettingsRecord::decode(model, &ack.value)?;
                println!("{}", record);
            }
        }
        Command::Write { target, ipv4 } => {
            let model = settings::infer_model(target.object_type, target.property).ok_or_else(|| {
                CliError::Usage(format!(
                    "{} property {} holds no known settings layout",
                    target.object(),
                    target.property
                ))
            })?;
            let ack = client.read_property(target.address, &target.read_request()).await?;
            let record = SettingsRecord::decode(model, &ack.value)?;
            let proxy = match ipv4 {
                Some(ip) => ip,
                None => public_address(&config).await?,
            };
            let value = record.encode(&SettingsPatch::new().proxy_address(proxy))?;
            let mut request = WritePropertyRequest::new(target.object(), target.property, value);
            request.array_index = target.index;
            client.write_property(target.address, &request).await?;
            println!(
                "proxy address {} -> {}",
                record.address_text(settings::Field::ProxyAddress),
                proxy
            );
        }
        Command::Reinit {
            address,
            state,
            password,
        } => {
            let request = ReinitializeDeviceRequest { state, password };
            client.reinitialize_device(address, &request).await?;
            println!("{:?} accepted by {}", state, address);
        }
        Command::Whois { address, low, high } => {
            let range = low.map(|low| (low, high.unwrap_or(low)));
            let devices = client.discover(address, range).await?;
            for device in &devices {
                println!(
                    "{:>8}  {:<21}  vendor {:<5}  max-apdu {}",
                    device.device_id, device.address, device.vendor_id, device.max_apdu
                );
            }
            log::info!("{} device(s) answered", devices.len());
        }
        Command::Save {
            address,
            device_instance,
        } => {
            let value = TagList::from(vec![Tag::application(ApplicationTag::Enumerated, vec![1u8])]);
            let request = WritePropertyRequest::new(
                device_object(device_instance),
                PropertyIdentifier::from(SAVE_SETTINGS_PROPERTY),
                value,
            );
            client.write_property(address, &request).await?;
            println!("settings of device {} saved", device_instance);
        }
        Command::Check { .. } => {}
    }
    Ok(())
}

async fn check<S, R>(
    stack: S,
    resolver: R,
    config: &CheckerConfig,
    target: Target,
) -> Result<(), CliError>
where
    S: ProtocolStack,
    R: PublicAddressResolver,
{
    let session = Session::new(stack, resolver, config.session());
    let mut workflow = CorrectionWorkflow::new(target);
    let completion = session.run(&mut workflow).await?;
    println!("{}", completion);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.global);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
