use fleetwire::selector;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: &VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("fleetwire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: fleetwire");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("FLEETWIRE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("transports: {}", selector::available().join(", "));
    println!("frame_version: {}", fleetwire_frame::WIRE_VERSION);

    Ok(SUCCESS)
}
