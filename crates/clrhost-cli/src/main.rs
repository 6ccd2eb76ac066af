use std::io::Read;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clrhost::discovery::DiscoveryReport;
use clrhost::isolation::{self, IsolatedInvocation};
use clrhost::{
    CoreClrConfig, Error, MonoConfig, NetFxConfig, Result, Runtime, RuntimeConfig, RuntimeKind,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clrhost")]
#[command(about = "Host Mono, CoreCLR or the .NET Framework and call a managed entry point")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the runtimes that can be found on this machine
    Runtimes {
        /// Explicit libmono path to report on
        #[arg(long)]
        libmono: Option<PathBuf>,
        /// dotnet installation root to report on
        #[arg(long)]
        dotnet_root: Option<PathBuf>,
    },
    /// Call `int Method(IntPtr data, int length)` in this process
    Invoke(InvokeArgs),
    /// Like `invoke`, but in a fresh child process
    Isolate(InvokeArgs),
    /// Child side of `isolate`: request JSON on stdin, packets on stdout
    #[command(hide = true)]
    Probe,
}

#[derive(Args)]
struct InvokeArgs {
    #[command(flatten)]
    runtime: RuntimeArgs,
    /// Assembly to load
    assembly: PathBuf,
    /// Namespace-qualified type, e.g. `Example.TestClass`
    type_name: String,
    /// Static method with the signature `int (IntPtr, int)`
    method_name: String,
    /// Payload passed as UTF-8 bytes
    #[arg(short, long, group = "payload")]
    data: Option<String>,
    /// Read the payload from a file
    #[arg(long, group = "payload")]
    data_file: Option<PathBuf>,
}

#[derive(Args)]
struct RuntimeArgs {
    /// Runtime to host (mono, coreclr, netfx)
    #[arg(short, long, required_unless_present = "config")]
    runtime: Option<RuntimeKind>,
    /// JSON configuration file, e.g. `{"mono": {"debug": true}}`
    #[arg(short, long, conflicts_with = "runtime")]
    config: Option<PathBuf>,

    /// [mono] Path to libmono
    #[arg(long, conflicts_with = "config")]
    libmono: Option<PathBuf>,
    /// [mono] Base class library directory (mono_set_dirs)
    #[arg(long, requires = "config_dir", conflicts_with = "config")]
    assembly_dir: Option<PathBuf>,
    /// [mono] Machine configuration directory (mono_set_dirs)
    #[arg(long, requires = "assembly_dir", conflicts_with = "config")]
    config_dir: Option<PathBuf>,
    /// [mono] Global configuration file, `/etc/mono/config` style
    #[arg(long, conflicts_with = "config")]
    global_config: Option<PathBuf>,
    /// [mono] Enable debugging support
    #[arg(long, conflicts_with = "config")]
    debug: bool,
    /// [mono] JIT option, repeatable (e.g. `--debugger-agent=...`)
    #[arg(long = "jit-option", allow_hyphen_values = true, conflicts_with = "config")]
    jit_options: Vec<String>,
    /// [mono] Chain Mono's signal handlers behind existing ones
    #[arg(long, conflicts_with = "config")]
    signal_chaining: bool,

    /// [mono, netfx] Application domain configuration file
    #[arg(long, conflicts_with = "config")]
    config_file: Option<PathBuf>,

    /// [coreclr] `*.runtimeconfig.json`; synthesized when omitted
    #[arg(long, conflicts_with = "config")]
    runtime_config: Option<PathBuf>,
    /// [coreclr] dotnet installation root
    #[arg(long, conflicts_with = "config")]
    dotnet_root: Option<PathBuf>,
    /// [coreclr] Runtime property as KEY=VALUE, repeatable
    #[arg(long = "property", value_parser = parse_property, conflicts_with = "config")]
    properties: Vec<(String, String)>,

    /// [netfx] Application domain name
    #[arg(long, conflicts_with = "config")]
    domain: Option<String>,
    /// [netfx] Bridge library path
    #[arg(long, conflicts_with = "config")]
    bridge: Option<PathBuf>,
}

impl RuntimeArgs {
    /// Per-kind flags that were given, with the kinds that accept them.
    fn given_options(&self) -> Vec<(&'static str, &'static [RuntimeKind])> {
        const MONO: &[RuntimeKind] = &[RuntimeKind::Mono];
        const CORECLR: &[RuntimeKind] = &[RuntimeKind::CoreClr];
        const NETFX: &[RuntimeKind] = &[RuntimeKind::NetFx];
        const DOMAIN_HOSTS: &[RuntimeKind] = &[RuntimeKind::Mono, RuntimeKind::NetFx];

        [
            ("--libmono", MONO, self.libmono.is_some()),
            ("--assembly-dir", MONO, self.assembly_dir.is_some()),
            ("--config-dir", MONO, self.config_dir.is_some()),
            ("--global-config", MONO, self.global_config.is_some()),
            ("--debug", MONO, self.debug),
            ("--jit-option", MONO, !self.jit_options.is_empty()),
            ("--signal-chaining", MONO, self.signal_chaining),
            ("--config-file", DOMAIN_HOSTS, self.config_file.is_some()),
            ("--runtime-config", CORECLR, self.runtime_config.is_some()),
            ("--dotnet-root", CORECLR, self.dotnet_root.is_some()),
            ("--property", CORECLR, !self.properties.is_empty()),
            ("--domain", NETFX, self.domain.is_some()),
            ("--bridge", NETFX, self.bridge.is_some()),
        ]
        .into_iter()
        .filter(|(_, _, given)| *given)
        .map(|(flag, kinds, _)| (flag, kinds))
        .collect()
    }

    fn to_config(&self) -> Result<RuntimeConfig> {
        if let Some(path) = &self.config {
            return RuntimeConfig::from_json_file(path);
        }

        let kind = self.runtime.unwrap_or(RuntimeKind::CoreClr);
        let foreign: Vec<&str> = self
            .given_options()
            .iter()
            .filter(|(_, kinds)| !kinds.contains(&kind))
            .map(|(flag, _)| *flag)
            .collect();
        if !foreign.is_empty() {
            return Err(Error::config(
                kind,
                format!("{} not accepted by {}", foreign.join(", "), kind),
            ));
        }

        let config = match kind {
            RuntimeKind::Mono => {
                let mut config = MonoConfig::new()
                    .with_debug(self.debug)
                    .with_signal_chaining(self.signal_chaining);
                config.libmono = self.libmono.clone();
                if let (Some(assembly_dir), Some(config_dir)) = (&self.assembly_dir, &self.config_dir) {
                    config = config.with_dirs(assembly_dir, config_dir);
                }
                if let Some(path) = &self.config_file {
                    config = config.with_config_file(path);
                }
                if let Some(path) = &self.global_config {
                    config = config.with_global_config_file(path);
                }
                for option in &self.jit_options {
                    config = config.with_jit_option(option.clone());
                }
                RuntimeConfig::Mono(config)
            }
            RuntimeKind::CoreClr => {
                let mut config = CoreClrConfig::new();
                config.runtime_config = self.runtime_config.clone();
                config.dotnet_root = self.dotnet_root.clone();
                for (key, value) in &self.properties {
                    config = config.with_property(key.clone(), value.clone());
                }
                RuntimeConfig::CoreClr(config)
            }
            RuntimeKind::NetFx => {
                let mut config = NetFxConfig::new();
                config.domain = self.domain.clone();
                config.config_file = self.config_file.clone();
                config.bridge_library = self.bridge.clone();
                RuntimeConfig::NetFx(config)
            }
        };
        Ok(config)
    }
}

impl InvokeArgs {
    fn payload(&self) -> Result<Vec<u8>> {
        match (&self.data, &self.data_file) {
            (Some(text), _) => Ok(text.as_bytes().to_vec()),
            (None, Some(path)) => Ok(std::fs::read(path)?),
            (None, None) => Ok(Vec::new()),
        }
    }

    fn to_invocation(&self) -> Result<IsolatedInvocation> {
        Ok(IsolatedInvocation::new(
            self.runtime.to_config()?,
            self.assembly.clone(),
            self.type_name.clone(),
            self.method_name.clone(),
        )
        .with_payload(self.payload()?))
    }
}

fn parse_property(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn main() {
    // stdout carries results and, for `probe`, the packet stream.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Runtimes {
            libmono,
            dotnet_root,
        } => {
            print_report(&DiscoveryReport::collect(
                libmono.as_deref(),
                dotnet_root.as_deref(),
            ));
            0
        }
        Commands::Invoke(args) => report(invoke(&args)),
        Commands::Isolate(args) => report(isolate(&args)),
        Commands::Probe => match probe() {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(e) => {
                eprintln!("Error: {}", e);
                2
            }
        },
    };
    std::process::exit(code);
}

fn report(result: Result<i32>) -> i32 {
    match result {
        Ok(value) => {
            println!("{}", value);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("  kind: {:?}, stage: {}", e.kind(), e.stage());
            1
        }
    }
}

fn invoke(args: &InvokeArgs) -> Result<i32> {
    let runtime = Runtime::new(args.runtime.to_config()?)?;
    let info = runtime.info();
    tracing::info!(kind = %info.kind, version = info.version.as_deref().unwrap_or("unknown"), "runtime constructed");

    let assembly = runtime.load_assembly(&args.assembly)?;
    let function = assembly.get_function(&args.type_name, &args.method_name)?;
    function.invoke(&args.payload()?)
}

fn isolate(args: &InvokeArgs) -> Result<i32> {
    let invocation = args.to_invocation()?;
    let program = std::env::current_exe()?;
    let outcome = invocation.run(&program)?;
    tracing::info!(
        pid = outcome.pid,
        kind = ?outcome.runtime_kind,
        version = outcome.runtime_version.as_deref().unwrap_or("unknown"),
        "isolated invocation finished"
    );
    Ok(outcome.value)
}

fn probe() -> Result<bool> {
    let mut request = String::new();
    std::io::stdin().read_to_string(&mut request)?;
    let request: IsolatedInvocation = serde_json::from_str(&request).map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unreadable request: {}", e),
        ))
    })?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    Ok(isolation::serve(&request, &mut out)?)
}

fn print_report(report: &DiscoveryReport) {
    println!("\n=== Mono ===\n");
    if report.libmono_candidates.is_empty() {
        println!("  no libmono candidates");
    }
    for candidate in &report.libmono_candidates {
        let marker = if candidate.is_file() { "[OK]  " } else { "      " };
        println!("  {}{}", marker, candidate.display());
    }

    println!("\n=== CoreCLR ===\n");
    match &report.dotnet_root {
        Some(root) => println!("  dotnet root: {}", root.display()),
        None => println!("  dotnet root: not found"),
    }
    if let Some(hostfxr) = &report.hostfxr {
        println!("  hostfxr:     {}", hostfxr.display());
    }
    for runtime in &report.runtimes {
        println!("  {}", runtime);
    }

    println!("\n=== .NET Framework ===\n");
    println!(
        "  {}",
        if report.netfx_supported {
            "supported on this platform"
        } else {
            "not available on this platform"
        }
    );

    if !report.problems.is_empty() {
        println!("\nProblems:");
        for problem in &report.problems {
            println!("  - {}", problem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use clrhost::ErrorKind;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_build_a_mono_config() {
        let cli = Cli::try_parse_from([
            "clrhost",
            "invoke",
            "--runtime",
            "mono",
            "--debug",
            "--jit-option",
            "--debugger-agent=transport=dt_socket,server=y,address=127.0.0.1:5831",
            "example.dll",
            "Example.TestClass",
            "Test",
            "--data",
            "testy mctestface",
        ])
        .unwrap();
        let Commands::Invoke(args) = cli.command else {
            panic!("expected invoke");
        };
        let RuntimeConfig::Mono(config) = args.runtime.to_config().unwrap() else {
            panic!("expected a Mono config");
        };
        assert!(config.debug);
        assert_eq!(config.jit_options.len(), 1);
        assert_eq!(args.payload().unwrap(), b"testy mctestface");
    }

    #[test]
    fn properties_parse_as_pairs() {
        assert_eq!(
            parse_property("System.GC.Server=true").unwrap(),
            ("System.GC.Server".to_string(), "true".to_string())
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }

    fn runtime_args(args: &[&str]) -> RuntimeArgs {
        let argv = ["clrhost", "invoke"]
            .iter()
            .chain(args)
            .chain(&["example.dll", "Example.TestClass", "Test"]);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Invoke(args) => args.runtime,
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn options_of_another_runtime_are_rejected() {
        let args = runtime_args(&[
            "--runtime",
            "coreclr",
            "--debug",
            "--jit-option",
            "--foo",
            "--domain",
            "d",
        ]);
        match args.to_config().unwrap_err() {
            Error::ConfigurationInvalid { kind, reason } => {
                assert_eq!(kind, RuntimeKind::CoreClr);
                assert!(reason.contains("--debug"), "{}", reason);
                assert!(reason.contains("--jit-option"), "{}", reason);
                assert!(reason.contains("--domain"), "{}", reason);
            }
            other => panic!("unexpected error: {other}"),
        }

        let args = runtime_args(&["--runtime", "mono", "--runtime-config", "app.runtimeconfig.json"]);
        assert_eq!(args.to_config().unwrap_err().kind(), ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn config_file_is_shared_by_domain_hosts() {
        let args = runtime_args(&["--runtime", "netfx", "--config-file", "app.config"]);
        let RuntimeConfig::NetFx(config) = args.to_config().unwrap() else {
            panic!("expected a .NET Framework config");
        };
        assert_eq!(config.config_file, Some(PathBuf::from("app.config")));

        let args = runtime_args(&["--runtime", "coreclr", "--config-file", "app.config"]);
        assert!(args.to_config().is_err());
    }

    #[test]
    fn mono_directory_flags() {
        let args = runtime_args(&[
            "--runtime",
            "mono",
            "--assembly-dir",
            "/usr/lib",
            "--config-dir",
            "/etc",
            "--config-file",
            "/srv/app/app.config",
            "--global-config",
            "/etc/mono/config",
            "--signal-chaining",
        ]);
        let RuntimeConfig::Mono(config) = args.to_config().unwrap() else {
            panic!("expected a Mono config");
        };
        assert_eq!(
            config,
            MonoConfig::new()
                .with_dirs("/usr/lib", "/etc")
                .with_config_file("/srv/app/app.config")
                .with_global_config_file("/etc/mono/config")
                .with_signal_chaining(true)
        );

        // mono_set_dirs needs both.
        assert!(
            Cli::try_parse_from([
                "clrhost", "invoke", "-r", "mono", "--assembly-dir", "/usr/lib", "a.dll", "T", "M"
            ])
            .is_err()
        );
    }

    #[test]
    fn runtime_flags_conflict_with_config_file() {
        assert!(
            Cli::try_parse_from([
                "clrhost", "invoke", "--config", "mono.json", "--debug", "a.dll", "T", "M"
            ])
            .is_err()
        );
    }

    #[test]
    fn runtime_or_config_is_required() {
        assert!(Cli::try_parse_from(["clrhost", "invoke", "a.dll", "T", "M"]).is_err());
    }
}
