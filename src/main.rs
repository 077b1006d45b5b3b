use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deepfake_detect::{
    config::{CliOverrides, ConfigLoader},
    handler::{self, AppState},
    render_summary, DetectResponse, Detector,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// 深度伪造检测工具 - 调用 Gemini 分析图片和视频是否经过伪造
#[derive(Parser, Debug)]
#[command(name = "deepfake-detect")]
#[command(about = "深度伪造检测：校验媒体、抽帧、逐帧分析并汇总结论", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别（trace, debug, info, warn, error）
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// CLI 模式：检测本地图片或视频，多个文件依次处理
    Analyze {
        /// 输入文件路径
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Gemini API key，也可以通过环境变量 GEMINI_API_KEY 设置
        #[arg(long)]
        api_key: Option<String>,

        /// 每个视频最多分析的帧数
        /// 可通过环境变量 DEEPFAKE_DETECT_MAX_FRAMES 或配置文件设置
        #[arg(long)]
        max_frames: Option<usize>,

        /// 单元分析失败后的重试次数
        #[arg(long)]
        retry_count: Option<u32>,

        /// 单次分析请求超时（秒）
        #[arg(long)]
        timeout: Option<u64>,

        /// 将 JSON 结果写入该文件
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Web 服务模式：启动 HTTP 检测服务
    Serve {
        /// 监听地址（默认从环境变量 FC_SERVER_PORT 读取，如果不存在则使用 0.0.0.0:9000）
        #[arg(short, long)]
        bind: Option<String>,

        /// /detect/direct 允许读取的目录，不设置则关闭该接口
        /// 可通过环境变量 DEEPFAKE_DETECT_DIRECT_ROOT 或配置文件 [server] direct_root 设置
        #[arg(long)]
        direct_root: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 配置文件路径
        #[arg(default_value = "deepfake-detect.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { path } = &args.command {
        ConfigLoader::create_default_config(path)
            .with_context(|| format!("生成配置文件失败: {}", path.display()))?;
        println!("已生成配置文件: {}", path.display());
        return Ok(());
    }

    let overrides = match &args.command {
        Commands::Analyze {
            max_frames,
            retry_count,
            timeout,
            ..
        } => CliOverrides {
            max_frames: *max_frames,
            retry_count: *retry_count,
            timeout_seconds: *timeout,
            log_level: args.log_level.clone(),
            ..CliOverrides::default()
        },
        Commands::Serve { direct_root, .. } => CliOverrides {
            direct_root: direct_root.clone(),
            log_level: args.log_level.clone(),
            ..CliOverrides::default()
        },
        _ => CliOverrides {
            log_level: args.log_level.clone(),
            ..CliOverrides::default()
        },
    };
    let config = ConfigLoader::load_config(args.config.as_deref(), overrides).context("加载配置失败")?;

    // 初始化日志：RUST_LOG 优先，否则使用配置中的级别
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Analyze {
            input,
            api_key,
            output,
            ..
        } => {
            let api_key = ConfigLoader::resolve_api_key(api_key)
                .context("缺少 Gemini API key，请使用 --api-key 或设置 GEMINI_API_KEY")?;

            tracing::info!(
                "使用配置: max_frames={}, retry_count={}, timeout={}s, model={}",
                config.max_frames_per_video,
                config.retry_count,
                config.request_timeout_seconds,
                config.model
            );

            let detector = Detector::with_gemini(reqwest::Client::new(), api_key, config)
                .context("创建检测器失败")?;
            analyze_files(&detector, &input, output.as_deref()).await?;
        }
        Commands::Serve { bind, .. } => {
            // 优先使用命令行参数，其次使用环境变量 FC_SERVER_PORT，最后使用默认值 9000
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("FC_SERVER_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
            });
            let state = AppState::new(config, ConfigLoader::resolve_api_key(None));
            start_web_server(&bind_addr, state).await?;
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

/// 依次检测每个文件，打印摘要；有文件失败时返回错误
async fn analyze_files(
    detector: &Detector,
    inputs: &[PathBuf],
    output: Option<&std::path::Path>,
) -> Result<()> {
    let mut responses = Vec::with_capacity(inputs.len());
    let mut failed = 0;

    for path in inputs {
        let request = detector.detect_path(path).await;
        let file_name = path.to_string_lossy();
        let response = DetectResponse::from_request(&request, Some(file_name.as_ref()));

        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("{}", path.display());
        match request.report() {
            Some(report) => print!("{}", render_summary(report)),
            None => {
                failed += 1;
                println!("❌ {}", response.message);
            }
        }
        responses.push(response);
    }

    if let Some(output) = output {
        let json = if responses.len() == 1 {
            serde_json::to_string_pretty(&responses[0])
        } else {
            serde_json::to_string_pretty(&responses)
        }
        .context("序列化结果失败")?;
        std::fs::write(output, json)
            .with_context(|| format!("写入结果失败: {}", output.display()))?;
        println!("结果已写入: {}", output.display());
    }

    if failed > 0 {
        anyhow::bail!("{}/{} 个文件检测失败", failed, inputs.len());
    }
    Ok(())
}

async fn start_web_server(bind: &str, state: AppState) -> Result<()> {
    let state_root = state.config.direct_root.clone();
    let app = handler::router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 上传检测: POST http://{}/detect?file_name=<name>", bind);
    match &state_root {
        Some(root) => tracing::info!(
            "  • 直接检测: POST http://{}/detect/direct（限 {}）",
            bind,
            root.display()
        ),
        None => tracing::info!("  • 直接检测: 未配置 direct_root，已关闭"),
    }
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
