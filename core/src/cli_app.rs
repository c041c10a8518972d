use crate::api::{ApiClient, MessagingBackend};
use crate::composer::{Composer, IgnoreReason, SubmitOutcome};
use crate::config::Config;
use crate::conversation_store::ConversationStore;
use crate::error::FluxError;
use crate::messenger::Messenger;
use crate::messenger_types::{ConversationEvent, Message, Peer, Post, UserId, UserProfile};
use crate::peer_directory::PeerDirectory;
use crate::push::ChannelState;
use crate::session::{Session, SessionFile};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const FEED_PAGE_SIZE: u32 = 20;

/// Entry point for the `flux` binary. `args` excludes the program name.
pub async fn run(config: Config, args: Vec<String>) -> anyhow::Result<()> {
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };
    let operands = &args[1..];

    match command.as_str() {
        "login" => {
            let [username, password] = expect_operands(operands, "login <username> <password>")?;
            let token = ApiClient::new(&config).login(username, password).await?;
            sign_in(&config, token)?;
        }
        "register" => {
            let [username, email, password] =
                expect_operands(operands, "register <username> <email> <password>")?;
            let token = ApiClient::new(&config)
                .register(username, email, password)
                .await?;
            sign_in(&config, token)?;
        }
        "logout" => {
            if SessionFile::new(&config.data_dir()).clear()? {
                println!("{} Signed out", "✓".green().bold());
            } else {
                println!("{}", "Not signed in".yellow());
            }
        }
        "whoami" => {
            let session = require_session(&config)?;
            let actor = session.actor();
            println!("{} ({})", actor.username.bright_white().bold(), actor.id.to_string().cyan());
            if let Some(exp) = session.expires_at() {
                let label = if session.is_expired(chrono::Utc::now()) {
                    "expired".red()
                } else {
                    "expires".dimmed()
                };
                println!("  {} {}", label, exp.to_rfc3339());
            }
        }
        "peers" => {
            let session = require_session(&config)?;
            let directory = PeerDirectory::new(
                Arc::new(ApiClient::for_session(&config, &session)),
                config.users_page_limit,
            );
            print_peers("Following", &directory.refresh().await?);
        }
        "followers" => {
            let api = authed_client(&config)?;
            print_peers("Followers", &api.followers().await?);
        }
        "users" => {
            let page = parse_or(operands.first(), 1)?;
            let api = authed_client(&config)?;
            let batch = api.users(page, config.users_page_limit).await?;
            print_users(&batch.users);
            println!(
                "{}",
                format!("page {}/{} · {} users", batch.page, batch.total_pages, batch.total_count).dimmed()
            );
        }
        "search" => {
            if operands.is_empty() {
                return Err(usage_error("search <query>"));
            }
            let api = authed_client(&config)?;
            print_users(&api.search_users(&operands.join(" ")).await?);
        }
        "follow" => {
            let [id] = expect_operands(operands, "follow <user_id>")?;
            let api = authed_client(&config)?;
            let user_id = parse_id(id)?;
            if api.follow_status(user_id).await? {
                println!("{}", format!("Already following {}", id).yellow());
            } else {
                api.follow(user_id).await?;
                println!("{} Following {}", "✓".green().bold(), id.cyan());
            }
        }
        "unfollow" => {
            let [id] = expect_operands(operands, "unfollow <user_id>")?;
            let api = authed_client(&config)?;
            let user_id = parse_id(id)?;
            if !api.follow_status(user_id).await? {
                println!("{}", format!("Not following {}", id).yellow());
            } else {
                api.unfollow(user_id).await?;
                println!("{} Unfollowed {}", "✓".green().bold(), id.cyan());
            }
        }
        "history" => {
            let [peer] = expect_operands(operands, "history <peer_id>")?;
            let peer_id = parse_id(peer)?;
            let session = require_session(&config)?;
            let (store, directory) = offline_store(&config, &session);
            store.select_conversation(peer_id).await?;
            directory.resolve(peer_id).await;
            if let Err(e) = directory.resolve_pending().await {
                tracing::warn!("Peer resolution failed: {}", e);
            }
            let peer = directory.resolve(peer_id).await;
            print_history(&peer, &store.messages(peer_id).await, session.actor().id);
        }
        "send" => {
            if operands.len() < 2 {
                return Err(usage_error("send <peer_id> <message>"));
            }
            let peer_id = parse_id(&operands[0])?;
            let session = require_session(&config)?;
            let (store, _) = offline_store(&config, &session);
            let backend: Arc<dyn MessagingBackend> = Arc::new(ApiClient::for_session(&config, &session));
            let composer = Composer::new(backend, store);
            composer.set_draft(peer_id, operands[1..].join(" ")).await;
            report_submit(composer.submit(peer_id).await?);
        }
        "chat" => {
            let [peer] = expect_operands(operands, "chat <peer_id>")?;
            let session = require_session(&config)?;
            chat(&config, session, parse_id(peer)?).await?;
        }
        "feed" => {
            let page = parse_or(operands.first(), 1)?;
            let feed = authed_client(&config)?.feed(page, FEED_PAGE_SIZE).await?;
            print_posts(&feed.posts);
            println!(
                "{}",
                format!("page {}/{} · {} posts", feed.page, feed.total_pages, feed.total_count).dimmed()
            );
        }
        "posts" => {
            print_posts(&authed_client(&config)?.posts().await?);
        }
        "post" => {
            if operands.is_empty() {
                return Err(usage_error("post <caption> [--image <url>]"));
            }
            let (caption, image_url) = split_image_flag(operands);
            let post = authed_client(&config)?.create_post(&caption, &image_url).await?;
            println!("{} Posted #{}", "✓".green().bold(), post.id.to_string().cyan());
        }
        "edit-post" => {
            if operands.len() < 2 {
                return Err(usage_error("edit-post <post_id> <caption> [--image <url>]"));
            }
            let id = parse_id(&operands[0])?;
            let (caption, image_url) = split_image_flag(&operands[1..]);
            let api = authed_client(&config)?;
            // Keep the current image unless a new one was given
            let image_url = if image_url.is_empty() {
                api.post(id).await?.image_url
            } else {
                image_url
            };
            let post = api.update_post(id, &caption, &image_url).await?;
            println!("{} Updated #{}", "✓".green().bold(), post.id.to_string().cyan());
        }
        "like" => {
            let [id] = expect_operands(operands, "like <post_id>")?;
            let post = authed_client(&config)?.like_post(parse_id(id)?).await?;
            println!("{} #{} now has {} likes", "♥".red(), post.id, post.likes);
        }
        "delete-post" => {
            let [id] = expect_operands(operands, "delete-post <post_id>")?;
            authed_client(&config)?.delete_post(parse_id(id)?).await?;
            println!("{} Deleted #{}", "✓".green().bold(), id.cyan());
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("{}", "⚡ Flux CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--api-url <url>] [--data-dir <path>] <command> [args]", "flux".cyan());
    println!();
    println!("{}", "Account:".bright_white().bold());
    println!("  {} <username> <password>           Sign in", "login".cyan());
    println!("  {} <username> <email> <password> Create an account", "register".cyan());
    println!("  {}                                Forget the stored login", "logout".cyan());
    println!("  {}                                Show the signed-in user", "whoami".cyan());
    println!();
    println!("{}", "Messages:".bright_white().bold());
    println!("  {} <peer_id>                     Print a conversation", "history".cyan());
    println!("  {} <peer_id> <message>              Send one message", "send".cyan());
    println!("  {} <peer_id>                        Live conversation (/quit to leave)", "chat".cyan());
    println!();
    println!("{}", "Friends:".bright_white().bold());
    println!("  {}                                 Users you follow", "peers".cyan());
    println!("  {}                             Users following you", "followers".cyan());
    println!("  {} [page]                          Browse all users", "users".cyan());
    println!("  {} <query>                        Find users", "search".cyan());
    println!("  {} / {} <user_id>            Change the follow graph", "follow".cyan(), "unfollow".cyan());
    println!();
    println!("{}", "Posts:".bright_white().bold());
    println!("  {} [page]                           Posts from people you follow", "feed".cyan());
    println!("  {}                                 Your posts", "posts".cyan());
    println!("  {} <caption> [--image <url>]        Publish a post", "post".cyan());
    println!("  {} <post_id> <caption> [--image <url>] Change a post", "edit-post".cyan());
    println!("  {} / {} <post_id>          Like or delete a post", "like".cyan(), "delete-post".cyan());
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn usage_error(usage: &str) -> anyhow::Error {
    anyhow::anyhow!("Usage: flux {}", usage)
}

fn expect_operands<'a, const N: usize>(operands: &'a [String], usage: &str) -> anyhow::Result<[&'a str; N]> {
    if operands.len() != N {
        return Err(usage_error(usage));
    }
    Ok(std::array::from_fn(|i| operands[i].as_str()))
}

fn parse_id(raw: &str) -> anyhow::Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| anyhow::anyhow!("`{}` is not a numeric id", raw))
}

fn parse_or(raw: Option<&String>, default: u32) -> anyhow::Result<u32> {
    match raw {
        Some(s) => s
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("`{}` is not a page number", s)),
        None => Ok(default),
    }
}

fn split_image_flag(operands: &[String]) -> (String, String) {
    let mut caption = Vec::new();
    let mut image_url = String::new();
    let mut i = 0;
    while i < operands.len() {
        if operands[i] == "--image" && i + 1 < operands.len() {
            image_url = operands[i + 1].clone();
            i += 2;
        } else {
            caption.push(operands[i].as_str());
            i += 1;
        }
    }
    (caption.join(" "), image_url)
}

fn sign_in(config: &Config, token: String) -> anyhow::Result<()> {
    let session = Session::init(token, None)
        .ok_or_else(|| anyhow::anyhow!("Server returned a token without a user identity"))?;
    SessionFile::new(&config.data_dir()).save(&session)?;
    println!(
        "{} Signed in as {} ({})",
        "✓".green().bold(),
        session.actor().username.bright_white().bold(),
        session.actor().id.to_string().cyan()
    );
    Ok(())
}

fn require_session(config: &Config) -> anyhow::Result<Session> {
    match SessionFile::new(&config.data_dir()).load()? {
        Some(session) => Ok(session),
        None => Err(FluxError::NotSignedIn.into()),
    }
}

fn authed_client(config: &Config) -> anyhow::Result<ApiClient> {
    let session = require_session(config)?;
    Ok(ApiClient::for_session(config, &session))
}

/// Store and directory without a push channel, for one-shot commands
fn offline_store(config: &Config, session: &Session) -> (ConversationStore, PeerDirectory) {
    let backend: Arc<dyn MessagingBackend> = Arc::new(ApiClient::for_session(config, session));
    let directory = PeerDirectory::new(backend.clone(), config.users_page_limit);
    let store = ConversationStore::new(session.actor().clone(), backend, directory.clone());
    (store, directory)
}

fn report_submit(outcome: SubmitOutcome) {
    match outcome {
        SubmitOutcome::Sent(message) => match message.id {
            Some(id) => println!("{} Message sent! ID: {}", "✓".green().bold(), id.to_string().cyan()),
            None => println!("{} Message sent!", "✓".green().bold()),
        },
        SubmitOutcome::Ignored(IgnoreReason::EmptyDraft) => {
            println!("{}", "Nothing to send".yellow());
        }
        SubmitOutcome::Ignored(IgnoreReason::AlreadySending) => {
            println!("{}", "Still sending the previous message".yellow());
        }
    }
}

// ─── Live chat ───────────────────────────────────────────────────────────────

async fn chat(config: &Config, session: Session, peer_id: UserId) -> anyhow::Result<()> {
    let me = session.actor().id;
    let messenger = Messenger::init(config, session);
    if let Err(e) = messenger.refresh_peers().await {
        eprintln!("{} {}", "!".yellow(), format!("Could not load peers: {}", e).dimmed());
    }

    let mut events = messenger.store().subscribe(peer_id);
    let (peer, history) = messenger.open_conversation(peer_id).await?;
    print_history(&peer, &history, me);
    println!("{}", "Type a message and press enter; /quit leaves.".dimmed());

    let mut channel = messenger.watch_channel();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                match messenger.send(peer_id, line).await {
                    Ok(SubmitOutcome::Sent(_)) => {}
                    Ok(outcome) => report_submit(outcome),
                    Err(e) => eprintln!("{} Not sent: {}", "✗".red().bold(), e),
                }
            }
            event = events.recv() => match event {
                Some(ConversationEvent::MessageAdded { message, .. }) => {
                    print_message(&message, &peer, me);
                }
                Some(_) => {}
                None => break,
            },
            changed = wait_channel_change(&mut channel) => {
                if let Some(state) = changed {
                    print_channel_state(&state);
                }
            }
        }
    }

    messenger.teardown().await;
    Ok(())
}

async fn wait_channel_change(
    channel: &mut Option<tokio::sync::watch::Receiver<ChannelState>>,
) -> Option<ChannelState> {
    let Some(rx) = channel.as_mut() else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        *channel = None;
        return None;
    }
    let state = rx.borrow_and_update().clone();
    Some(state)
}

fn print_channel_state(state: &ChannelState) {
    match state {
        ChannelState::Connected => println!("{}", "● live".green()),
        ChannelState::Reconnecting { attempt, delay } => println!(
            "{}",
            format!("○ reconnecting (attempt {}, in {:?})", attempt, delay).yellow()
        ),
        ChannelState::Failed(reason) => {
            println!("{}", format!("✗ live updates stopped: {}", reason).red())
        }
        ChannelState::Connecting | ChannelState::Closed => {}
    }
}

// ─── Printing ────────────────────────────────────────────────────────────────

fn print_peers(title: &str, peers: &[Peer]) {
    if peers.is_empty() {
        println!("{}", "No users found".yellow());
        return;
    }
    println!("{}", format!("{} ({})", title, peers.len()).bright_cyan().bold());
    println!("{}", "─".repeat(60).dimmed());
    for peer in peers {
        println!(
            "  {} {} {}",
            format!("{:>6}", peer.id).cyan(),
            peer.username.bright_white(),
            format!(
                "· {} followers · {} following",
                peer.metadata.followers_count, peer.metadata.following_count
            )
            .dimmed()
        );
    }
}

fn print_users(users: &[UserProfile]) {
    let peers: Vec<Peer> = users.iter().cloned().map(Peer::from).collect();
    print_peers("Users", &peers);
    for user in users.iter().filter(|u| u.is_following == Some(true)) {
        println!("  {} you follow {}", "✓".green(), user.username);
    }
}

fn print_history(peer: &Peer, messages: &[Message], me: UserId) {
    println!(
        "{}",
        format!("Conversation with {} ({})", peer.username, peer.id)
            .bright_cyan()
            .bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    if messages.is_empty() {
        println!("{}", "No messages yet. Start the conversation!".dimmed());
    }
    for message in messages {
        print_message(message, peer, me);
    }
}

fn print_message(message: &Message, peer: &Peer, me: UserId) {
    let when = message
        .created_at
        .with_timezone(&chrono::Local)
        .format("%b %d %H:%M")
        .to_string();
    let who = if message.sender_id == me {
        "you".green().bold()
    } else {
        peer.username.as_str().blue().bold()
    };
    println!("{} {}: {}", when.dimmed(), who, message.content);
}

fn print_posts(posts: &[Post]) {
    if posts.is_empty() {
        println!("{}", "No posts yet".yellow());
        return;
    }
    for post in posts {
        let author = post
            .user
            .as_ref()
            .map(|u| u.username.clone())
            .unwrap_or_else(|| format!("user {}", post.user_id));
        println!(
            "{} {} {}",
            format!("#{}", post.id).cyan(),
            author.bright_white().bold(),
            format!("♥ {}", post.likes).red()
        );
        if !post.caption.is_empty() {
            println!("  {}", post.caption);
        }
        if !post.image_url.is_empty() {
            println!("  {}", post.image_url.dimmed());
        }
    }
}
