use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Echo everything back to each peer.
    Server,
    /// Send lines and check the echo.
    Client,
    /// Run both ends in one process.
    Both,
}

#[derive(Parser, Debug)]
#[command(about = "Echo lines over an RDMA byte stream")]
pub struct Cli {
    #[arg(value_enum, default_value_t = Role::Both)]
    pub role: Role,
    #[arg(short, long, default_value = "127.0.0.1:7471")]
    pub addr: String,
    /// Lines the client sends before hanging up.
    #[arg(short, long, default_value_t = 8)]
    pub count: usize,
}
