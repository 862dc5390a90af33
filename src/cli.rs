use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "breaker")]
#[command(author, version, about = "Reverse tunnel broker: expose services behind NAT", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行门户（公网服务端）
    Portal {
        /// 配置文件路径
        #[arg(short, long, default_value = "portal.toml")]
        config: String,
    },
    /// 运行网桥（内网客户端）
    Bridge {
        /// 配置文件路径
        #[arg(short, long, default_value = "bridge.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
    /// 输出配置模板
    Template {
        /// 模板类型 (portal, bridge)
        #[arg(value_parser = ["portal", "bridge"])]
        template_type: String,

        /// 输出文件路径，不指定时打印到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
}
