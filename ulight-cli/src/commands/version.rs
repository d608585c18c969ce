//! Version command - show version information.

use anyhow::Result;
use ulight_host::abi;

/// Version information.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the version command.
pub fn run() -> Result<()> {
    println!("ulight - WebAssembly syntax highlighter host");
    println!();
    println!("Version:     {}", VERSION);
    println!(
        "Platform:    {} / {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!();
    println!("Guest ABI:");
    println!("  state record  {} bytes", abi::RequestState::SIZE);
    println!("  token record  {} bytes", abi::TOKEN_SIZE);

    Ok(())
}
