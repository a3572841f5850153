use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use wikibot_core::bot::{BotOptions, Choice, ReplaceBot, RunReport};
use wikibot_core::cache::BotCache;
use wikibot_core::combine::ContentIter;
use wikibot_core::config::{BotConfig, load_config};
use wikibot_core::factory::{GeneratorFactory, PageStream};
use wikibot_core::fixes::{FixSet, load_fixes};
use wikibot_core::page::PageContent;
use wikibot_core::replace::{Replacer, ReplacementRule};
use wikibot_core::site::{ClientConfig, MediaWikiClient, Site, WriteSite};
use wikibot_core::translator::Translator;

#[derive(Debug, Parser)]
#[command(
    name = "wikibot",
    version,
    about = "MediaWiki maintenance bot: page generators and text replacement"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = "wikibot.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List the pages a generator expression selects")]
    List(ListArgs),
    #[command(about = "Run text replacements over the selected pages")]
    Replace(ReplaceArgs),
    #[command(about = "Show the available fixes")]
    Fixes,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, help = "Fetch page text while listing")]
    preload: bool,
    /// Generator and filter options in -name:value form, e.g.
    /// -cat:Birds -ns:0 -titleregex:^A
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    tokens: Vec<String>,
}

#[derive(Debug, Args)]
struct ReplaceArgs {
    #[arg(long, value_name = "NAME", help = "Apply a predefined fix; repeatable")]
    fix: Vec<String>,
    #[arg(long, help = "Treat command-line pairs as regular expressions")]
    regex: bool,
    #[arg(long, help = "Case-insensitive matching for command-line pairs")]
    nocase: bool,
    #[arg(long, help = "Re-apply the rules until the text stops changing")]
    recursive: bool,
    #[arg(long, help = "Save every edit without asking")]
    always: bool,
    #[arg(long, help = "Show diffs without saving anything")]
    dry_run: bool,
    #[arg(long, value_name = "TEXT", help = "Edit summary overriding the generated one")]
    summary: Option<String>,
    #[arg(long, value_name = "CODE", help = "Summary language (default from config)")]
    lang: Option<String>,
    #[arg(long, help = "Skip pages already saved by an earlier interrupted run")]
    resume: bool,
    /// Old/new text pairs and generator options, e.g.
    /// "colour" "color" -cat:Chemistry -ns:0
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    tokens: Vec<String>,
}

fn main() -> Result<()> {
    // A missing .env file is fine; variables may be set directly.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WIKIBOT_LOG")
                .unwrap_or_else(|_| EnvFilter::new("wikibot=info,wikibot_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::List(args) => run_list(&config, args),
        Commands::Replace(args) => run_replace(&config, args),
        Commands::Fixes => run_fixes(&config),
    }
}

fn connect(config: &BotConfig) -> Result<Rc<RefCell<MediaWikiClient>>> {
    let client = MediaWikiClient::new(ClientConfig::from_config(config))?;
    Ok(Rc::new(RefCell::new(client)))
}

fn factory_with_prompt(site: Site, config: &BotConfig) -> GeneratorFactory {
    let mut factory = GeneratorFactory::new(site).with_prompt(Box::new(ask_line));
    factory.set_batch_size(config.batch_size());
    factory
}

fn ask_line(question: &str) -> Option<String> {
    print!("{question} ");
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    let line = line.trim().to_string();
    (!line.is_empty()).then_some(line)
}

fn no_generator_help() {
    println!("No pages to work on: no generator option was given.");
    println!("Available generator and filter options (as -name:value):");
    let names: Vec<&str> = GeneratorFactory::flag_names().collect();
    println!("  {}", names.join(", "));
}

fn run_list(config: &BotConfig, args: ListArgs) -> Result<()> {
    let handle = connect(config)?;
    let site: Site = handle.clone();
    let mut factory = factory_with_prompt(site, config);
    for token in &args.tokens {
        if !factory.handle_arg(token)? {
            bail!("unknown option: {token}");
        }
    }
    let Some(stream) = factory.combined(args.preload)? else {
        no_generator_help();
        return Ok(());
    };
    let mut count = 0usize;
    match stream {
        PageStream::Refs(pages) => {
            for page in pages {
                println!("{page}");
                count += 1;
            }
        }
        PageStream::Loaded(pages) => {
            for content in pages {
                println!("{} ({} bytes)", content.page, content.text.len());
                count += 1;
            }
        }
    }
    println!("{count} pages");
    Ok(())
}

fn run_fixes(config: &BotConfig) -> Result<()> {
    let catalog = load_fixes(config.run.user_fixes.as_deref())?;
    for name in catalog.names() {
        let Some(fix) = catalog.get(name) else { continue };
        let generator = if fix.generator.is_empty() {
            String::new()
        } else {
            format!(", generator: {}", fix.generator.join(" "))
        };
        println!("{name}: {} rules{generator}", fix.rules.len());
    }
    Ok(())
}

fn run_replace(config: &BotConfig, args: ReplaceArgs) -> Result<()> {
    let handle = connect(config)?;
    let site: Site = handle.clone();
    let write_site: WriteSite = handle.clone();

    if !args.dry_run {
        login_from_env(&write_site)?;
    }

    let groups = collect_fix_groups(config, &args)?;
    let mut factory = factory_with_prompt(site.clone(), config);
    let mut pairs: Vec<String> = Vec::new();
    for token in &args.tokens {
        if factory.handle_arg(token)? {
            continue;
        }
        if token.starts_with('-') {
            bail!("unknown option: {token}");
        }
        pairs.push(token.clone());
    }
    let groups = with_command_line_pairs(groups, pairs, &args)?;

    // A fix may carry its own generator expression, used when the command
    // line selected no pages itself.
    if !factory.has_sources() {
        let canned: Vec<String> = groups
            .iter()
            .flat_map(|group| group.generator.iter().cloned())
            .collect();
        for token in canned {
            factory.handle_arg(&token)?;
        }
    }

    let mut replacer = Replacer::new(groups);
    if args.recursive {
        replacer = replacer.with_recursive(true);
    }
    if replacer.is_empty() {
        bail!("nothing to replace: give old/new text pairs or -fix:<name>");
    }

    let Some(stream) = factory.combined(true)? else {
        no_generator_help();
        return Ok(());
    };
    let PageStream::Loaded(pages) = stream else {
        bail!("replacement needs loaded page text");
    };

    let site_id = site.borrow().site_id();
    let mut cache = BotCache::open(&config.state_dir(), "replace", &site_id)?;
    let pages: ContentIter = if args.resume {
        let done: std::collections::HashSet<String> = cache
            .keys()
            .filter_map(|key| key.strip_prefix("done:"))
            .map(str::to_string)
            .collect();
        Box::new(pages.filter(move |content| !done.contains(content.title())))
    } else {
        pages
    };

    let options = BotOptions {
        always: args.always,
        dry_run: args.dry_run,
        summary: args.summary.clone(),
        lang: args.lang.clone().unwrap_or_else(|| config.summary_lang()),
    };
    let translator = Translator::builtin()?;
    let mut bot =
        ReplaceBot::new(write_site, replacer, translator, options).with_confirm(Box::new(confirm));

    let report = bot.run(pages)?;
    record_run(&mut cache, &report)?;
    print!("{report}");
    Ok(())
}

fn login_from_env(site: &WriteSite) -> Result<()> {
    let username = std::env::var("WIKI_USERNAME").ok();
    let password = std::env::var("WIKI_PASSWORD").ok();
    match (username, password) {
        (Some(username), Some(password)) => site
            .borrow_mut()
            .login(&username, &password)
            .context("login failed"),
        _ => {
            warn!("WIKI_USERNAME/WIKI_PASSWORD not set, editing anonymously");
            Ok(())
        }
    }
}

fn collect_fix_groups(config: &BotConfig, args: &ReplaceArgs) -> Result<Vec<FixSet>> {
    if args.fix.is_empty() {
        return Ok(Vec::new());
    }
    let mut catalog = load_fixes(config.run.user_fixes.as_deref())?;
    let mut groups = Vec::new();
    for name in &args.fix {
        match catalog.take(name) {
            Some(fix) => groups.push(fix),
            None => {
                let known: Vec<&str> = catalog.names().collect();
                bail!("unknown fix: {name} (available: {})", known.join(", "));
            }
        }
    }
    Ok(groups)
}

fn with_command_line_pairs(
    mut groups: Vec<FixSet>,
    pairs: Vec<String>,
    args: &ReplaceArgs,
) -> Result<Vec<FixSet>> {
    if pairs.is_empty() {
        return Ok(groups);
    }
    if pairs.len() % 2 != 0 {
        bail!("replacement pairs must come as old/new couples, got {} values", pairs.len());
    }
    let mut rules = Vec::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks(2) {
        rules.push(ReplacementRule::build(
            &pair[0],
            &pair[1],
            args.regex,
            args.nocase,
            None,
        )?);
    }
    groups.push(FixSet::ad_hoc("command-line", rules, args.recursive));
    Ok(groups)
}

fn record_run(cache: &mut BotCache, report: &RunReport) -> Result<()> {
    for title in &report.saved_titles {
        cache.set(format!("done:{title}"), serde_json::Value::Bool(true));
    }
    cache.save()
}

fn confirm(content: &PageContent, diff: &str) -> Choice {
    println!("\n>>> {} <<<", content.page);
    println!("{diff}");
    loop {
        let Some(answer) = ask_line("Save this edit? [y]es/[n]o/[a]ll/[q]uit:") else {
            return Choice::Quit;
        };
        match answer.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('y') => return Choice::Yes,
            Some('n') => return Choice::No,
            Some('a') => return Choice::All,
            Some('q') => return Choice::Quit,
            _ => println!("Please answer y, n, a or q."),
        }
    }
}
