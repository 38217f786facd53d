mod config;
mod error;
mod explore;
mod gpt;
mod quiz;
mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use config::Config;
use dotenv::dotenv;
use error::GptError;
use explore::stream::TailStatus;
use explore::StreamChunk;
use gpt::{rate_limit::RateLimiter, transport::Transport, GptService, UserContext};
use quiz::{ExamType, Quiz, QuizQuestion};
use session::{ChatTurn, History, SessionId};
use teloxide::{
    dispatching::dialogue::InMemStorage,
    prelude::*,
    types::{ChatAction, KeyboardButton, KeyboardMarkup, KeyboardRemove, MessageId},
    utils::command::BotCommands,
};
use tokio::sync::watch;

type BotDialogue = Dialogue<State, InMemStorage<State>>;
type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// One playground round: the question on screen and how the learner is doing.
#[derive(Clone, Debug)]
pub struct PlaygroundRound {
    topic: String,
    level: u8,
    question: QuizQuestion,
    score: u32,
    asked: u32,
}

#[derive(Clone, Default)]
pub enum State {
    #[default]
    Start,
    ReceiveAge,
    ReceiveModeChoice {
        profile: UserContext,
    },
    Explore {
        profile: UserContext,
    },
    PlaygroundReceiveTopic {
        profile: UserContext,
    },
    Playground {
        profile: UserContext,
        round: PlaygroundRound,
    },
    TestReceiveExamType {
        profile: UserContext,
    },
    TestReceiveTopic {
        profile: UserContext,
        exam: ExamType,
    },
    TestQuiz {
        profile: UserContext,
        quiz: Quiz,
    },
    Trend {
        profile: UserContext,
    },
}

impl State {
    fn profile(&self) -> Option<UserContext> {
        match self {
            State::Start | State::ReceiveAge => None,
            State::ReceiveModeChoice { profile }
            | State::Explore { profile }
            | State::PlaygroundReceiveTopic { profile }
            | State::Playground { profile, .. }
            | State::TestReceiveExamType { profile }
            | State::TestReceiveTopic { profile, .. }
            | State::TestQuiz { profile, .. }
            | State::Trend { profile } => Some(*profile),
        }
    }
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
enum Command {
    #[command(description = "start over.")]
    Start,
    #[command(description = "choose what to do next.")]
    Menu,
    #[command(description = "list the topics you explored.")]
    History,
    #[command(description = "reopen a topic from the history, e.g. /open 3.")]
    Open(u64),
    #[command(description = "forget the history.")]
    Clear,
    #[command(description = "show this text.")]
    Help,
}

/// Everything the handlers share.
struct App {
    gpt: GptService,
    limiter: RateLimiter,
    histories: Mutex<HashMap<ChatId, History>>,
    config: Config,
}

impl App {
    /// Runs `f` on the chat's history. A chat left without sessions is
    /// dropped from the map.
    fn with_history<R>(&self, chat_id: ChatId, f: impl FnOnce(&mut History) -> R) -> R {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let history = histories.entry(chat_id).or_default();
        let result = f(history);
        if history.sessions().is_empty() {
            histories.remove(&chat_id);
        }
        result
    }

    /// Stores `chunk` as the answer of `session_id` and returns the stored
    /// turn, or `None` when a newer session took over the chat.
    fn record(&self, chat_id: ChatId, session_id: SessionId, chunk: &StreamChunk) -> Option<ChatTurn> {
        self.with_history(chat_id, |history| {
            if !history.apply_chunk(session_id, chunk) {
                return None;
            }
            history.active().and_then(|s| s.answer().cloned())
        })
    }

    fn admit(&self, chat_id: ChatId) -> Result<(), GptError> {
        self.limiter.check(&chat_id.to_string())
    }
}

#[tokio::main]
async fn main() {
    if dotenv().is_err() {
        println!("No .env file found, reading configuration from the environment");
    }
    pretty_env_logger::init();
    log::info!("Starting explorer bot...");

    let config = Config::from_env().expect("Invalid configuration");
    log::info!("Generation endpoint: {}", config.endpoint);

    let transport = Transport::new(config.endpoint.clone(), config.connect_timeout)
        .expect("Unable to build the HTTP client");
    let app = Arc::new(App {
        gpt: GptService::new(transport),
        limiter: RateLimiter::new(config.limits),
        histories: Mutex::new(HashMap::new()),
        config,
    });

    let bot = Bot::from_env();

    let handler = Update::filter_message()
        .enter_dialogue::<Message, InMemStorage<State>, State>()
        .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
        .branch(dptree::case![State::Start].endpoint(start))
        .branch(dptree::case![State::ReceiveAge].endpoint(receive_age))
        .branch(dptree::case![State::ReceiveModeChoice { profile }].endpoint(receive_mode_choice))
        .branch(dptree::case![State::Explore { profile }].endpoint(explore))
        .branch(dptree::case![State::PlaygroundReceiveTopic { profile }].endpoint(receive_playground_topic))
        .branch(dptree::case![State::Playground { profile, round }].endpoint(playground))
        .branch(dptree::case![State::TestReceiveExamType { profile }].endpoint(receive_exam_type))
        .branch(dptree::case![State::TestReceiveTopic { profile, exam }].endpoint(receive_test_topic))
        .branch(dptree::case![State::TestQuiz { profile, quiz }].endpoint(test_quiz))
        .branch(dptree::case![State::Trend { profile }].endpoint(trend));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![InMemStorage::<State>::new(), app])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

const GREETING_TEXT: &str = "Hi! I explain any topic in a few short paragraphs and quiz you on it. \
                             How old are you? I'll tune the explanations to your age.";

const EXPLORE_MODE: &str = "🔭 Explore a topic";
const PLAYGROUND_MODE: &str = "🎯 Playground quiz";
const TEST_MODE: &str = "📝 Exam test set";
const TREND_MODE: &str = "📱 Explain it with trends";
const MENU_BUTTON: &str = "📋 Menu";

const EXAMPLE_TOPICS: [&str; 3] = ["Quantum Physics", "Machine Learning", "World History"];

fn menu_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(EXPLORE_MODE), KeyboardButton::new(PLAYGROUND_MODE)],
        vec![KeyboardButton::new(TEST_MODE), KeyboardButton::new(TREND_MODE)],
    ])
}

fn topic_keyboard() -> KeyboardMarkup {
    let mut rows: Vec<Vec<KeyboardButton>> = EXAMPLE_TOPICS
        .iter()
        .map(|t| vec![KeyboardButton::new(*t)])
        .collect();
    rows.push(vec![KeyboardButton::new(MENU_BUTTON)]);
    KeyboardMarkup::new(rows)
}

/// The message text, if it is usable as a topic or an answer.
fn text_of(msg: &Message) -> Option<&str> {
    msg.text().map(str::trim).filter(|t| !t.is_empty())
}

async fn show_menu(bot: &Bot, dialogue: &BotDialogue, chat_id: ChatId, profile: UserContext) -> HandlerResult {
    bot.send_message(chat_id, "What would you like to do?")
        .reply_markup(menu_keyboard())
        .await?;
    dialogue.update(State::ReceiveModeChoice { profile }).await?;
    Ok(())
}

async fn start(bot: Bot, dialogue: BotDialogue, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, GREETING_TEXT)
        .reply_markup(KeyboardRemove::new())
        .await?;
    dialogue.update(State::ReceiveAge).await?;
    Ok(())
}

async fn handle_command(
    bot: Bot,
    dialogue: BotDialogue,
    msg: Message,
    cmd: Command,
    app: Arc<App>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let profile = dialogue.get().await?.and_then(|s| s.profile());

    match cmd {
        Command::Start => start(bot, dialogue, msg).await?,
        Command::Help => {
            bot.send_message(chat_id, Command::descriptions().to_string())
                .await?;
        }
        Command::Menu => match profile {
            Some(profile) => show_menu(&bot, &dialogue, chat_id, profile).await?,
            None => start(bot, dialogue, msg).await?,
        },
        Command::History => {
            let listing = app.with_history(chat_id, |history| {
                history
                    .sessions()
                    .iter()
                    .map(|s| {
                        format!(
                            "{}. {} ({})",
                            s.id,
                            s.initial_query,
                            s.created_at.format("%Y-%m-%d %H:%M UTC")
                        )
                    })
                    .collect::<Vec<_>>()
            });
            let text = if listing.is_empty() {
                "Nothing explored yet.".to_string()
            } else {
                format!("📚 Your topics, newest first:\n{}\n\nReopen one with /open <number>.", listing.join("\n"))
            };
            bot.send_message(chat_id, text).await?;
        }
        Command::Open(number) => {
            let opened = app.with_history(chat_id, |history| {
                let id = history.find(number)?;
                history.open(id).and_then(|s| s.answer().cloned())
            });
            match (opened, profile) {
                (Some(answer), Some(profile)) => {
                    let text = if answer.text.is_empty() {
                        "That answer never arrived. Send the topic again to retry.".to_string()
                    } else {
                        answer.text.clone()
                    };
                    bot.send_message(chat_id, text).await?;
                    send_related(&bot, chat_id, &answer).await?;
                    dialogue.update(State::Explore { profile }).await?;
                }
                (Some(_), None) => start(bot, dialogue, msg).await?,
                (None, _) => {
                    bot.send_message(chat_id, format!("There is no topic number {number} in /history."))
                        .await?;
                }
            }
        }
        Command::Clear => {
            app.with_history(chat_id, History::clear);
            bot.send_message(chat_id, "History cleared.").await?;
        }
    }
    Ok(())
}

async fn receive_age(bot: Bot, dialogue: BotDialogue, msg: Message) -> HandlerResult {
    let age = text_of(&msg).and_then(|t| t.parse::<u8>().ok());
    match age {
        Some(age) if (5..=100).contains(&age) => {
            bot.send_message(msg.chat.id, format!("Got it, {age} it is!"))
                .await?;
            show_menu(&bot, &dialogue, msg.chat.id, UserContext { age }).await
        }
        _ => {
            bot.send_message(msg.chat.id, "Please send your age as a number, e.g. 14")
                .await?;
            Ok(())
        }
    }
}

async fn receive_mode_choice(
    bot: Bot,
    dialogue: BotDialogue,
    profile: UserContext,
    msg: Message,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    match text_of(&msg) {
        Some(EXPLORE_MODE) => {
            bot.send_message(chat_id, "What do you want to explore?")
                .reply_markup(topic_keyboard())
                .await?;
            dialogue.update(State::Explore { profile }).await?;
        }
        Some(PLAYGROUND_MODE) => {
            bot.send_message(chat_id, "Pick a topic for the playground. Questions get harder as you get them right.")
                .reply_markup(topic_keyboard())
                .await?;
            dialogue.update(State::PlaygroundReceiveTopic { profile }).await?;
        }
        Some(TEST_MODE) => {
            let keyboard = KeyboardMarkup::new(vec![vec![
                KeyboardButton::new(ExamType::Jee.to_string()),
                KeyboardButton::new(ExamType::Neet.to_string()),
            ]]);
            bot.send_message(chat_id, "Which exam are you preparing for?")
                .reply_markup(keyboard)
                .await?;
            dialogue.update(State::TestReceiveExamType { profile }).await?;
        }
        Some(TREND_MODE) => {
            bot.send_message(chat_id, "Send me a topic and I'll explain it with memes and trends.")
                .reply_markup(topic_keyboard())
                .await?;
            dialogue.update(State::Trend { profile }).await?;
        }
        _ => {
            bot.send_message(chat_id, "Please choose one of the options")
                .reply_markup(menu_keyboard())
                .await?;
        }
    }
    Ok(())
}

async fn explore(
    bot: Bot,
    dialogue: BotDialogue,
    profile: UserContext,
    msg: Message,
    app: Arc<App>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let query = match text_of(&msg) {
        Some(MENU_BUTTON) => return show_menu(&bot, &dialogue, chat_id, profile).await,
        Some(query) => query.to_string(),
        None => {
            bot.send_message(chat_id, "Send me a topic as text").await?;
            return Ok(());
        }
    };

    if let Err(err) = app.admit(chat_id) {
        bot.send_message(chat_id, err.user_message()).await?;
        return Ok(());
    }
    stream_explanation(&bot, &app, chat_id, &query, profile).await
}

/// Streams an explanation into a single message that grows as text arrives,
/// then offers the related topics and questions as buttons.
async fn stream_explanation(
    bot: &Bot,
    app: &Arc<App>,
    chat_id: ChatId,
    query: &str,
    profile: UserContext,
) -> HandlerResult {
    let session_id = app.with_history(chat_id, |history| history.start_session(query));

    // Nice to have, not worth failing over
    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
    let placeholder = bot
        .send_message(chat_id, format!("🤔 Exploring {query}..."))
        .reply_markup(KeyboardRemove::new())
        .await?;

    let (tx, rx) = watch::channel(String::new());
    let editor = tokio::spawn(edit_while_streaming(
        bot.clone(),
        chat_id,
        placeholder.id,
        rx,
        app.config.edit_interval,
    ));

    let sink_app = app.clone();
    let sink = move |chunk: StreamChunk| {
        if sink_app.record(chat_id, session_id, &chunk).is_some() && !chunk.text.is_empty() {
            tx.send_replace(chunk.text);
        }
    };

    // The sink and its sender are dropped together with the stream future,
    // which lets the editor apply the last text and stop.
    let outcome = tokio::time::timeout(
        app.config.stream_deadline,
        app.gpt.stream_explore_content(query, &profile, sink),
    )
    .await;
    if let Err(err) = editor.await {
        log::error!("Message editor task failed: {}", err);
    }

    let answer = app.with_history(chat_id, |history| {
        if !history.is_active(session_id) {
            return None;
        }
        history.active().and_then(|s| s.answer().cloned())
    });
    let Some(mut answer) = answer else {
        log::debug!("Session {} in chat {} was replaced while streaming", session_id, chat_id);
        return Ok(());
    };
    let got_text = !answer.text.is_empty();

    match outcome {
        Err(_) => {
            log::warn!("Explanation of {:?} hit the {:?} deadline", query, app.config.stream_deadline);
            let note = if got_text {
                "⏱ That took too long, this is all I got."
            } else {
                "⏱ That took too long. Please try again."
            };
            bot.send_message(chat_id, note).await?;
        }
        Ok(Err(err)) => {
            log::error!("Explanation of {:?} failed: {}", query, err);
            if got_text {
                bot.send_message(chat_id, err.user_message()).await?;
            } else {
                bot.edit_message_text(chat_id, placeholder.id, err.user_message())
                    .await?;
            }
        }
        Ok(Ok(summary)) if !got_text => {
            log::warn!("Stream for {:?} carried no text, asking once more: {:?}", query, summary);
            let retry = match app.admit(chat_id) {
                Ok(()) => app.gpt.get_explore_content(query, &profile).await,
                Err(err) => Err(err),
            };
            match retry {
                Ok(response) => {
                    let chunk = StreamChunk::from(response);
                    bot.edit_message_text(chat_id, placeholder.id, chunk.text.clone())
                        .await?;
                    let Some(turn) = app.record(chat_id, session_id, &chunk) else {
                        return Ok(());
                    };
                    answer = turn;
                }
                Err(err) => {
                    log::error!("Explanation of {:?} failed: {}", query, err);
                    bot.edit_message_text(chat_id, placeholder.id, err.user_message())
                        .await?;
                }
            }
        }
        Ok(Ok(summary)) => {
            if let TailStatus::Incomplete { .. } | TailStatus::Missing = summary.tail {
                bot.send_message(chat_id, "Related topics are unavailable this time.")
                    .await?;
            }
        }
    }

    send_related(bot, chat_id, &answer).await
}

async fn edit_while_streaming(
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
    mut rx: watch::Receiver<String>,
    interval: Duration,
) {
    let mut shown = String::new();
    while rx.changed().await.is_ok() {
        let text = rx.borrow_and_update().clone();
        show_text(&bot, chat_id, message_id, &mut shown, text).await;
        tokio::time::sleep(interval).await;
    }
    let text = rx.borrow().clone();
    show_text(&bot, chat_id, message_id, &mut shown, text).await;
}

async fn show_text(bot: &Bot, chat_id: ChatId, message_id: MessageId, shown: &mut String, text: String) {
    if text.is_empty() || text == *shown {
        return;
    }
    match bot.edit_message_text(chat_id, message_id, text.clone()).await {
        Ok(_) => *shown = text,
        Err(err) => log::debug!("Could not update the streaming message: {}", err),
    }
}

/// Lists the related topics and questions and turns them into buttons, so
/// that tapping one explores it next.
async fn send_related(bot: &Bot, chat_id: ChatId, answer: &ChatTurn) -> HandlerResult {
    let topics = answer.topics.as_deref().unwrap_or_default();
    let questions = answer.questions.as_deref().unwrap_or_default();

    let mut text = String::new();
    let mut rows = Vec::new();
    if !topics.is_empty() {
        text.push_str("🔗 Related topics\n");
        for t in topics {
            text.push_str(&format!("• {} ({}): {}\n", t.topic, t.kind, t.reason));
            rows.push(vec![KeyboardButton::new(t.topic.clone())]);
        }
    }
    if !questions.is_empty() {
        text.push_str("\n❓ Questions to wonder about\n");
        for q in questions {
            text.push_str(&format!("• {}\n", q.question));
            rows.push(vec![KeyboardButton::new(q.question.clone())]);
        }
    }
    rows.push(vec![KeyboardButton::new(MENU_BUTTON)]);

    if text.is_empty() {
        text.push_str("Send another topic to keep exploring.");
    }
    bot.send_message(chat_id, text.trim_end())
        .reply_markup(KeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

async fn receive_playground_topic(
    bot: Bot,
    dialogue: BotDialogue,
    profile: UserContext,
    msg: Message,
    app: Arc<App>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let topic = match text_of(&msg) {
        Some(MENU_BUTTON) => return show_menu(&bot, &dialogue, chat_id, profile).await,
        Some(topic) => topic.to_string(),
        None => {
            bot.send_message(chat_id, "Send me a topic as text").await?;
            return Ok(());
        }
    };
    ask_playground_question(&bot, &dialogue, &app, chat_id, profile, topic, 1, 0, 0).await
}

#[allow(clippy::too_many_arguments)]
async fn ask_playground_question(
    bot: &Bot,
    dialogue: &BotDialogue,
    app: &App,
    chat_id: ChatId,
    profile: UserContext,
    topic: String,
    level: u8,
    score: u32,
    asked: u32,
) -> HandlerResult {
    if let Err(err) = app.admit(chat_id) {
        bot.send_message(chat_id, err.user_message()).await?;
        return show_menu(bot, dialogue, chat_id, profile).await;
    }

    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
    let question = match app.gpt.get_playground_question(&topic, level, &profile).await {
        Ok(question) => question,
        Err(err) => {
            log::error!("Playground question on {:?} failed: {}", topic, err);
            bot.send_message(chat_id, err.user_message())
                .reply_markup(topic_keyboard())
                .await?;
            dialogue.update(State::PlaygroundReceiveTopic { profile }).await?;
            return Ok(());
        }
    };

    send_question(bot, chat_id, &format!("Level {level}/10"), &question).await?;
    dialogue
        .update(State::Playground {
            profile,
            round: PlaygroundRound {
                topic,
                level,
                question,
                score,
                asked,
            },
        })
        .await?;
    Ok(())
}

async fn send_question(bot: &Bot, chat_id: ChatId, heading: &str, question: &QuizQuestion) -> HandlerResult {
    let labels = question.labelled_options();
    let text = format!("{heading}\n\n{}\n\n{}", question.text, labels.join("\n"));

    let mut rows: Vec<Vec<KeyboardButton>> = labels
        .into_iter()
        .map(|label| vec![KeyboardButton::new(label)])
        .collect();
    rows.push(vec![KeyboardButton::new(MENU_BUTTON)]);

    bot.send_message(chat_id, text)
        .reply_markup(KeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

fn feedback(question: &QuizQuestion, correct: bool) -> String {
    let verdict = if correct {
        "✅ Correct!".to_string()
    } else {
        format!(
            "❌ Not quite. The answer is {}.",
            question.correct_option().unwrap_or_default()
        )
    };
    format!(
        "{verdict}\n{}\n💡 {}",
        question.explanation.correct, question.explanation.key_point
    )
}

async fn playground(
    bot: Bot,
    dialogue: BotDialogue,
    (profile, round): (UserContext, PlaygroundRound),
    msg: Message,
    app: Arc<App>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let reply = match text_of(&msg) {
        Some(MENU_BUTTON) => {
            bot.send_message(chat_id, format!("Final score: {}/{}", round.score, round.asked))
                .await?;
            return show_menu(&bot, &dialogue, chat_id, profile).await;
        }
        Some(reply) => reply,
        None => {
            bot.send_message(chat_id, "Please pick one of the options").await?;
            return Ok(());
        }
    };
    if round.question.answer_index(reply).is_none() {
        bot.send_message(chat_id, "Please pick one of the options").await?;
        return Ok(());
    }

    let correct = round.question.is_correct(reply);
    let (score, level) = if correct {
        (round.score + 1, (round.level + 1).min(10))
    } else {
        (round.score, round.level.saturating_sub(1).max(1))
    };
    let asked = round.asked + 1;

    bot.send_message(
        chat_id,
        format!("{}\n\nScore: {score}/{asked}", feedback(&round.question, correct)),
    )
    .await?;

    ask_playground_question(&bot, &dialogue, &app, chat_id, profile, round.topic, level, score, asked).await
}

async fn receive_exam_type(
    bot: Bot,
    dialogue: BotDialogue,
    profile: UserContext,
    msg: Message,
) -> HandlerResult {
    match text_of(&msg).and_then(ExamType::parse) {
        Some(exam) => {
            bot.send_message(msg.chat.id, format!("Which {exam} topic should the test cover?"))
                .reply_markup(KeyboardRemove::new())
                .await?;
            dialogue.update(State::TestReceiveTopic { profile, exam }).await?;
        }
        None => {
            bot.send_message(msg.chat.id, "Please choose JEE or NEET").await?;
        }
    }
    Ok(())
}

async fn receive_test_topic(
    bot: Bot,
    dialogue: BotDialogue,
    (profile, exam): (UserContext, ExamType),
    msg: Message,
    app: Arc<App>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let Some(topic) = text_of(&msg) else {
        bot.send_message(chat_id, "Send me a topic as text").await?;
        return Ok(());
    };
    if let Err(err) = app.admit(chat_id) {
        bot.send_message(chat_id, err.user_message()).await?;
        return Ok(());
    }

    bot.send_message(chat_id, format!("Preparing a {exam} test on {topic}, this can take a moment..."))
        .await?;
    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;

    let questions = match app.gpt.get_test_questions(topic, exam).await {
        Ok(questions) => questions,
        Err(err) => {
            log::error!("{} test on {:?} failed: {}", exam, topic, err);
            bot.send_message(chat_id, err.user_message()).await?;
            return show_menu(&bot, &dialogue, chat_id, profile).await;
        }
    };

    let quiz = Quiz::new(questions);
    ask_test_question(&bot, chat_id, &quiz).await?;
    dialogue.update(State::TestQuiz { profile, quiz }).await?;
    Ok(())
}

async fn ask_test_question(bot: &Bot, chat_id: ChatId, quiz: &Quiz) -> HandlerResult {
    if let Some(question) = quiz.current() {
        let heading = format!(
            "Question {}/{} (difficulty {})",
            quiz.current_question + 1,
            quiz.questions.len(),
            question.difficulty
        );
        send_question(bot, chat_id, &heading, question).await?;
    }
    Ok(())
}

async fn test_quiz(
    bot: Bot,
    dialogue: BotDialogue,
    (profile, mut quiz): (UserContext, Quiz),
    msg: Message,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let reply = text_of(&msg).unwrap_or_default();
    if reply == MENU_BUTTON {
        return show_menu(&bot, &dialogue, chat_id, profile).await;
    }

    let Some(question) = quiz.current().cloned() else {
        return show_menu(&bot, &dialogue, chat_id, profile).await;
    };
    if question.answer_index(reply).is_none() {
        bot.send_message(chat_id, "Please pick one of the options").await?;
        return Ok(());
    }

    if let Some(correct) = quiz.answer(reply) {
        bot.send_message(chat_id, feedback(&question, correct)).await?;
    }

    if quiz.is_finished() {
        bot.send_message(
            chat_id,
            format!(
                "Test finished! You answered {} of {} questions correctly.",
                quiz.score,
                quiz.questions.len()
            ),
        )
        .await?;
        return show_menu(&bot, &dialogue, chat_id, profile).await;
    }

    ask_test_question(&bot, chat_id, &quiz).await?;
    dialogue.update(State::TestQuiz { profile, quiz }).await?;
    Ok(())
}

/// Telegram rejects messages longer than 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

fn split_message(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if current.chars().count() + line.chars().count() + 1 > MAX_MESSAGE_CHARS && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        let mut line = line;
        while line.chars().count() > MAX_MESSAGE_CHARS {
            let cut = line
                .char_indices()
                .nth(MAX_MESSAGE_CHARS)
                .map_or(line.len(), |(i, _)| i);
            parts.push(line[..cut].to_string());
            line = &line[cut..];
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        parts.push(current.trim_end().to_string());
    }
    parts
}

async fn trend(
    bot: Bot,
    dialogue: BotDialogue,
    profile: UserContext,
    msg: Message,
    app: Arc<App>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let query = match text_of(&msg) {
        Some(MENU_BUTTON) => return show_menu(&bot, &dialogue, chat_id, profile).await,
        Some(query) => query,
        None => {
            bot.send_message(chat_id, "Send me a topic as text").await?;
            return Ok(());
        }
    };
    if let Err(err) = app.admit(chat_id) {
        bot.send_message(chat_id, err.user_message()).await?;
        return Ok(());
    }

    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
    match app.gpt.explore_query(query).await {
        Ok(text) => {
            for part in split_message(&text) {
                bot.send_message(chat_id, part).await?;
            }
            bot.send_message(chat_id, "Send another topic, or go back to the menu.")
                .reply_markup(topic_keyboard())
                .await?;
        }
        Err(err) => {
            log::error!("Trend explanation of {:?} failed: {}", query, err);
            bot.send_message(chat_id, err.user_message()).await?;
        }
    }
    Ok(())
}
