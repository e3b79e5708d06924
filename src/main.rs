use std::process;
use std::sync::Arc;
use std::time::Duration;

use rassegna::{
    application::{
        error::AppError, feeds::FeedService, posts::PostService, repos::PostStore,
        tweets::TweetService,
    },
    config::{self, Command, RenderArgs, Settings},
    infra::{
        error::InfraError,
        http::{RouterState, build_router},
        store::MemoryPostStore,
        telemetry,
    },
    prerender::{Prerenderer, RenderOptions, spawn_change_watcher},
};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    // Startup failed before telemetry came up; report through a one-off
    // subscriber so the error is not lost.
    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let command = cli
        .command
        .unwrap_or(Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        Command::Serve(_) => run_serve(settings).await,
        Command::Render(args) => run_render(settings, args).await,
    }
}

struct ApplicationContext {
    state: RouterState,
    store: Arc<MemoryPostStore>,
}

async fn build_context(settings: &Settings) -> Result<ApplicationContext, AppError> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("rassegna/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| AppError::unexpected(format!("failed to build http client: {err}")))?;

    let store = Arc::new(MemoryPostStore::new(settings.authors.clone()));
    let posts = Arc::new(PostService::new(store.clone() as Arc<dyn PostStore>));
    let feeds = Arc::new(FeedService::new(
        http.clone(),
        settings.feeds.urls.clone(),
        settings.authors.clone(),
    ));
    let tweets = Arc::new(TweetService::new(
        http,
        settings.twitter.api_base.clone(),
        settings.twitter.bearer_token.clone(),
    ));

    let stylesheet_body = match &settings.prerender.stylesheet_path {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .map_err(|err| AppError::from(InfraError::Io(err)))?,
        ),
        None => None,
    };
    let prerenderer = Arc::new(Prerenderer::new(
        settings.prerender.to_config(stylesheet_body),
    ));

    let public_url = Url::parse(&settings.prerender.public_url)
        .map_err(|err| AppError::unexpected(format!("invalid public url: {err}")))?;

    Ok(ApplicationContext {
        state: RouterState {
            posts,
            feeds,
            tweets,
            prerender: prerenderer,
            public_url,
        },
        store,
    })
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let context = build_context(&settings).await?;

    // Keep the prerender cache honest for the year currently being written.
    let current_year = OffsetDateTime::now_utc().year().to_string();
    let watcher = spawn_change_watcher(
        context.store.clone() as Arc<dyn PostStore>,
        context.state.prerender.clone(),
        context.state.public_url.clone(),
        current_year,
    );

    let feed_refresher =
        spawn_feed_refresher(context.state.feeds.clone(), settings.feeds.refresh_interval());
    let tweet_refresher = settings.twitter.screen_name.clone().map(|screen_name| {
        spawn_tweet_refresher(
            context.state.tweets.clone(),
            screen_name,
            settings.twitter.refresh_interval(),
        )
    });

    let router = build_router(context.state.clone());
    let listener = tokio::net::TcpListener::bind(settings.server.listen_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "rassegna::server",
        addr = %settings.server.listen_addr,
        "listening"
    );

    let result = axum::serve(listener, router.into_make_service())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    watcher.abort();
    feed_refresher.abort();
    if let Some(handle) = tweet_refresher {
        handle.abort();
    }
    result
}

async fn run_render(settings: Settings, args: RenderArgs) -> Result<(), AppError> {
    let context = build_context(&settings).await?;

    let mut options = RenderOptions::default();
    if args.nocache {
        options.use_cache = false;
    }
    if args.noinline {
        options.inline_styles = false;
        options.inline_scripts = false;
    }
    if args.noreduce {
        options.only_critical_requests = false;
    }
    if args.noheadless {
        options.headless = false;
    }

    let url = args
        .url
        .unwrap_or_else(|| settings.prerender.public_url.clone());
    let html = context
        .state
        .prerender
        .render(&url, &options)
        .await
        .map_err(|err| AppError::unexpected(format!("render failed: {err}")))?;

    println!("{html}");
    Ok(())
}

fn spawn_feed_refresher(feeds: Arc<FeedService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        // The first tick fires immediately, so feeds load at startup.
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            feeds.refresh().await;
        }
    })
}

fn spawn_tweet_refresher(
    tweets: Arc<TweetService>,
    screen_name: String,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            tweets.refresh(&screen_name).await;
        }
    })
}
