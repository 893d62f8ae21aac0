use clap::Parser;
use eyre::{Result, WrapErr};
use log::info;

mod bytes;
mod clock;
mod commands;
mod connection;
mod glob;
mod keyspace;
mod logger;
mod proto;
mod server;

/// A minimal in-memory key-value server.
#[derive(Debug, Parser)]
struct Args {
	/// TCP port to listen on.
	#[clap(long, default_value_t = 6379)]
	port: u16,
}

fn main() -> Result<()> {
	logger::init();

	let Args { port } = Args::parse();

	let mut server = server::Server::bind(port).wrap_err_with(|| format!("binding to port {port} failed"))?;
	info!("mini-redis listening on port {port}");

	server.run().wrap_err("event loop failed")?;

	info!("shut down cleanly");
	Ok(())
}
