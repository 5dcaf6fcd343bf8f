// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    commands::{handled_error, Handle, HandledResult},
    parser::ProxyConfig,
};

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// File holding a `proxy { ... }` section, e.g. cut out of a drbd resource.
    file: String,
}

pub fn proxy(args: &ProxyArgs) -> HandledResult<()> {
    let text = std::fs::read_to_string(&args.file)
        .handle_err(|e| eprintln!("Could not read \"{}\": {e}", args.file))?;

    match ProxyConfig::parse(&text)
        .handle_err(|e| eprintln!("Could not parse \"{}\": {e}", args.file))?
    {
        Some(config) => {
            for (key, value) in config.iter() {
                println!("{key} = {value}");
            }
            Ok(())
        }
        None => {
            eprintln!("No proxy section in \"{}\".", args.file);
            handled_error()
        }
    }
}
