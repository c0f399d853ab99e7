use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futuresbot::indicators::IndicatorEngine;
use futuresbot::{
    BinanceFuturesClient, ClientRequestId, EngineError, Exchange, OrderIntent, PaperExchange,
    Settings, Side, TradingEngine,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "futuresbot")]
#[command(about = "Binance USD-M futures execution and risk engine", long_about = None)]
struct Cli {
    /// TOML settings file (defaults to ./futuresbot.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Trade against the in-memory paper exchange instead of Binance
    #[arg(long, global = true)]
    paper: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the clock, reconciliation and market data loops until Ctrl-C
    Run,
    /// Print the latest price for a symbol
    Price { symbol: String },
    /// Print wallet balances
    Account,
    /// Print reconciled positions
    Positions,
    /// Reconcile and print open orders known to this process
    Orders,
    /// Submit an order
    Order {
        symbol: String,
        #[arg(value_enum)]
        side: CliSide,
        quantity: f64,
        /// Limit price; a market order is sent when omitted
        #[arg(long)]
        price: Option<f64>,
        /// Reuse a client request id (safe resubmission)
        #[arg(long)]
        id: Option<String>,
    },
    /// Cancel an open order by client request id
    Cancel { symbol: String, id: String },
    /// Compute SMA20, SMA50 and RSI14 over recent closed bars
    Indicators {
        symbol: String,
        #[arg(short, long)]
        interval: Option<String>,
        #[arg(short, long)]
        limit: Option<u16>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliSide {
    Buy,
    Sell,
}

impl From<CliSide> for Side {
    fn from(side: CliSide) -> Self {
        match side {
            CliSide::Buy => Side::Buy,
            CliSide::Sell => Side::Sell,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    setup_logging(cli.debug);

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let exchange: Arc<dyn Exchange> = if cli.paper {
        tracing::info!("Using the paper exchange");
        Arc::new(PaperExchange::from_settings(&settings.exchange))
    } else {
        Arc::new(BinanceFuturesClient::new(&settings.exchange)?)
    };

    let engine = Arc::new(TradingEngine::new(exchange, settings));

    match cli.command {
        Commands::Run => run(engine).await?,
        Commands::Price { symbol } => {
            let price = engine.gateway().ticker_price(&symbol.to_uppercase()).await?;
            println!("{} {:.4}", symbol.to_uppercase(), price);
        }
        Commands::Account => {
            engine.sync_clock().await?;
            let balances = engine.balances().await?;
            println!(
                "{:<8} | {:>16} | {:>16} | {:>14}",
                "Asset", "Balance", "Available", "Unrealized"
            );
            println!("{}", "-".repeat(64));
            for balance in balances {
                println!(
                    "{:<8} | {:>16.4} | {:>16.4} | {:>14.4}",
                    balance.asset,
                    balance.balance,
                    balance.available_balance,
                    balance.unrealized_pnl
                );
            }
        }
        Commands::Positions => {
            engine.sync_clock().await?;
            engine.reconcile().await?;
            print_positions(&engine).await;
        }
        Commands::Orders => {
            engine.sync_clock().await?;
            let report = engine.reconcile().await?;
            print_orders(&engine).await;
            if !report.orphaned.is_empty() {
                println!("\n{} open order(s) not placed by this process:", report.orphaned.len());
                for order in &report.orphaned {
                    println!(
                        "  {} {} {} {:.4} @ {:.4} (exchange id {})",
                        order.symbol,
                        order.side,
                        order.kind.as_str(),
                        order.quantity,
                        order.price,
                        order.exchange_order_id
                    );
                }
            }
        }
        Commands::Order {
            symbol,
            side,
            quantity,
            price,
            id,
        } => {
            engine.start().await;

            let mut intent = match price {
                Some(price) => OrderIntent::limit(&symbol, side.into(), quantity, price),
                None => OrderIntent::market(&symbol, side.into(), quantity),
            };
            if let Some(id) = id {
                intent = intent.with_client_request_id(id);
            }

            let record = engine.submit_intent(intent).await?;
            println!(
                "{} {} {} {:.4} -> {} (filled {:.4} @ {:.4})",
                record.client_request_id,
                record.symbol,
                record.side,
                record.quantity,
                record.state,
                record.filled_quantity,
                record.avg_fill_price
            );
        }
        Commands::Cancel { symbol, id } => {
            engine.start().await;
            let id = ClientRequestId::from(id);
            match engine.cancel_intent(&id).await {
                Ok(record) => {
                    println!("{} {} -> {}", record.client_request_id, record.symbol, record.state)
                }
                // Placed by an earlier run: look it up on the exchange instead
                Err(EngineError::UnknownOrder { .. }) => {
                    let symbol = symbol.to_uppercase();
                    let Some(order) = engine.gateway().get_order(&symbol, &id).await? else {
                        bail!("{} has no order {}", symbol, id);
                    };
                    if !order.status.is_live() {
                        bail!("order {} is no longer open ({:?})", id, order.status);
                    }
                    let ack = engine
                        .gateway()
                        .cancel_order(&symbol, &order.exchange_order_id, &id)
                        .await?;
                    println!("{} {} -> {:?}", id, symbol, ack.status);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Indicators {
            symbol,
            interval,
            limit,
        } => {
            let symbol = symbol.to_uppercase();
            let market = &engine.settings().market_data;
            let interval = interval.unwrap_or_else(|| market.interval.clone());
            let limit = limit.unwrap_or(market.limit);

            let bars = engine.gateway().klines(&symbol, &interval, limit).await?;
            if bars.is_empty() {
                bail!("no closed {} bars for {}", interval, symbol);
            }

            let mut indicators = IndicatorEngine::new();
            indicators.catch_up(&bars);
            let snapshot = indicators.snapshot();

            println!("{} ({} bars of {})", symbol, bars.len(), interval);
            println!("  SMA20: {}", format_value(snapshot.sma20));
            println!("  SMA50: {}", format_value(snapshot.sma50));
            println!("  RSI14: {}", format_value(snapshot.rsi14));
        }
    }

    Ok(())
}

async fn run(engine: Arc<TradingEngine>) -> Result<()> {
    let settings = engine.settings();
    tracing::info!(
        exchange = engine.gateway().exchange_name(),
        symbols = ?settings.market_data.symbols,
        interval = %settings.market_data.interval,
        "Starting futuresbot"
    );

    for symbol in &settings.market_data.symbols {
        let rule = engine.risk_rule(symbol).await;
        tracing::info!(
            symbol = %rule.symbol,
            max_position_size = rule.max_position_size,
            stop_loss = ?rule.stop_loss_price,
            take_profit = ?rule.take_profit_price,
            "Risk rule"
        );
    }

    engine.start().await;
    let handles = engine.spawn_loops();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping loops");
    engine.shutdown();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }

    let open: Vec<_> = engine
        .list_orders()
        .await
        .into_iter()
        .filter(|o| !o.state.is_terminal())
        .collect();
    if !open.is_empty() {
        tracing::warn!(open = open.len(), "Exiting with open orders on the exchange");
    }

    Ok(())
}

async fn print_positions(engine: &TradingEngine) {
    let positions = engine.list_positions().await;
    if positions.is_empty() {
        println!("No open positions");
        return;
    }

    println!(
        "{:<12} | {:>12} | {:>12} | {:>12} | {:>12}",
        "Symbol", "Net qty", "Entry", "Mark", "uPnL"
    );
    println!("{}", "-".repeat(70));
    for position in positions {
        println!(
            "{:<12} | {:>12.4} | {:>12.4} | {:>12.4} | {:>12.4}",
            position.symbol,
            position.net_quantity,
            position.entry_price,
            position.mark_price,
            position.unrealized_pnl
        );
    }
}

async fn print_orders(engine: &TradingEngine) {
    let orders = engine.list_orders().await;
    if orders.is_empty() {
        println!("No orders placed by this process");
        return;
    }

    for order in orders {
        println!(
            "{:<34} {:<10} {:<4} {:<6} {:>10.4} filled {:>10.4} {}",
            order.client_request_id,
            order.symbol,
            order.side,
            order.kind.as_str(),
            order.quantity,
            order.filled_quantity,
            order.state
        );
    }
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.4}", v),
        None => "n/a (insufficient history)".to_string(),
    }
}

fn setup_logging(debug: bool) {
    let default = if debug {
        "futuresbot=debug"
    } else {
        "futuresbot=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
