use std::{io, sync::Arc, time::Duration};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ollama_session::{
    ConnectionState, ConversationState, ErrorKind, InferenceConnection, Message, ModelCatalog,
    ModelId, Role, SessionSnapshot, SessionStatus,
};
use ratatui::{prelude::*, widgets::*};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

// --- Error Handling ---
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Channel Receive Error")]
    ChannelReceive,
}

// --- Application State ---
enum InputMode {
    Normal,
    Editing,
}

// --- Events for Async Communication ---
#[derive(Debug)]
pub enum AppEvent {
    ModelsFetched(Result<Vec<ModelId>, ErrorKind>),
    ConnectFinished(ModelId, Result<(), ErrorKind>),
    GenerationFinished(SessionSnapshot),
}

pub struct App {
    input_mode: InputMode,
    input_buffer: String,
    models: Vec<ModelId>,
    selected_model_index: Option<usize>,
    status_message: String,
    scroll_offset: u16,
    catalog: Arc<ModelCatalog>,
    connection: Arc<InferenceConnection>,
    conversation: ConversationState,
    event_receiver: mpsc::Receiver<AppEvent>,
    event_sender: mpsc::Sender<AppEvent>,
}

impl App {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        connection: Arc<InferenceConnection>,
        conversation: ConversationState,
        rx: mpsc::Receiver<AppEvent>,
        tx: mpsc::Sender<AppEvent>,
    ) -> Self {
        App {
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            models: Vec::new(),
            selected_model_index: None,
            status_message: "Fetching models...".to_string(),
            scroll_offset: 0,
            catalog,
            connection,
            conversation,
            event_receiver: rx,
            event_sender: tx,
        }
    }

    fn selected_model(&self) -> Option<ModelId> {
        self.selected_model_index
            .and_then(|index| self.models.get(index).cloned())
    }

    pub fn refresh_models(&mut self) {
        self.status_message = "Fetching models...".to_string();
        self.catalog.invalidate();
        let catalog = self.catalog.clone();
        let event_sender = self.event_sender.clone();
        tokio::spawn(async move {
            let result = catalog.list_models().await;
            if event_sender.send(AppEvent::ModelsFetched(result)).await.is_err() {
                error!("failed to send fetched models back to main loop");
            }
        });
    }

    fn connect_selected(&mut self) {
        let Some(model) = self.selected_model() else {
            self.status_message = "Select a model first (j/k).".to_string();
            return;
        };
        self.status_message = format!("Connecting to {}...", model);
        let connection = self.connection.clone();
        let event_sender = self.event_sender.clone();
        tokio::spawn(async move {
            let result = connection.connect(model.clone()).await;
            let _ = event_sender
                .send(AppEvent::ConnectFinished(model, result))
                .await;
        });
    }

    fn submit_prompt(&mut self) {
        match self.conversation.submit(&self.input_buffer) {
            Ok(session) => {
                self.input_buffer.clear();
                self.scroll_offset = 0;
                self.status_message = "Generating... (x: cancel)".to_string();
                let event_sender = self.event_sender.clone();
                tokio::spawn(async move {
                    let snapshot = session.wait().await;
                    let _ = event_sender
                        .send(AppEvent::GenerationFinished(snapshot))
                        .await;
                });
            }
            // a refused submission is a notice, not a failure
            Err(kind) if kind.is_validation() => {
                self.status_message = format!("Cannot send: {}", kind);
            }
            Err(kind) => {
                self.status_message = format!("Error: {}", kind);
            }
        }
        // Always return to Normal mode after trying to submit
        self.input_mode = InputMode::Normal;
    }

    fn handle_event(&mut self, app_event: AppEvent) {
        match app_event {
            AppEvent::ModelsFetched(Ok(models)) => {
                self.models = models;
                if self.models.is_empty() {
                    self.selected_model_index = None;
                    self.status_message = "No models found on Ollama server.".to_string();
                } else {
                    self.selected_model_index = Some(0);
                    self.status_message = format!(
                        "{} models loaded. Select: j/k, Connect: c, Chat: Enter (then Ctrl+S to send)",
                        self.models.len()
                    );
                }
            }
            AppEvent::ModelsFetched(Err(e)) => {
                self.status_message = format!("Error fetching models: {}", e);
            }
            AppEvent::ConnectFinished(model, Ok(())) => {
                self.status_message = format!("Connected to {}. Press Enter to type.", model);
            }
            AppEvent::ConnectFinished(model, Err(e)) if e.is_validation() => {
                self.status_message = format!("Cannot connect to {}: {}", model, e);
            }
            AppEvent::ConnectFinished(model, Err(e)) => {
                self.status_message = format!("Error connecting to {}: {}", model, e);
            }
            AppEvent::GenerationFinished(snapshot) => {
                self.status_message = match snapshot.status {
                    SessionStatus::Completed => "Response received.".to_string(),
                    SessionStatus::Cancelled => "Generation cancelled.".to_string(),
                    SessionStatus::Failed(kind) => format!("Error occurred: {}", kind),
                    other => format!("Generation ended: {:?}", other),
                };
            }
        }
    }

    fn scroll_down(&mut self, amount: u16) {
        self.scroll_offset = self.scroll_offset.saturating_add(amount);
    }

    fn scroll_up(&mut self, amount: u16) {
        self.scroll_offset = self.scroll_offset.saturating_sub(amount);
    }
}

// --- Main Event Loop ---
pub async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<(), AppError> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => match app.input_mode {
                    InputMode::Normal => match key.code {
                        KeyCode::Char('q') => {
                            app.conversation.cancel();
                            return Ok(());
                        }
                        KeyCode::Char('j') | KeyCode::Down => {
                            if !app.models.is_empty() {
                                let i = app.selected_model_index.unwrap_or(0);
                                let next = if i >= app.models.len() - 1 { 0 } else { i + 1 };
                                app.selected_model_index = Some(next);
                            }
                        }
                        KeyCode::Char('k') | KeyCode::Up => {
                            if !app.models.is_empty() {
                                let i = app.selected_model_index.unwrap_or(0);
                                let prev = if i == 0 { app.models.len() - 1 } else { i - 1 };
                                app.selected_model_index = Some(prev);
                            }
                        }
                        KeyCode::Char('c') => app.connect_selected(),
                        KeyCode::Char('r') => app.refresh_models(),
                        KeyCode::Char('x') => {
                            if !app.conversation.cancel() {
                                app.status_message = "Nothing to cancel.".to_string();
                            }
                        }
                        KeyCode::Char('e') => {
                            app.connection.eject();
                            app.status_message = "Model ejected.".to_string();
                        }
                        KeyCode::Enter => {
                            if app.connection.current_model().is_some() {
                                app.input_mode = InputMode::Editing;
                                app.status_message =
                                    "Editing prompt... Enter: Newline, Ctrl+S: Send, Esc: Cancel."
                                        .to_string();
                            } else {
                                app.status_message =
                                    "Connect to a model first (c).".to_string();
                            }
                        }
                        KeyCode::PageDown => app.scroll_down(10),
                        KeyCode::PageUp => app.scroll_up(10),
                        _ => {}
                    },
                    InputMode::Editing => match (key.code, key.modifiers) {
                        (KeyCode::Char('s'), KeyModifiers::CONTROL) => app.submit_prompt(),
                        (KeyCode::Enter, _) => app.input_buffer.push('\n'),
                        (KeyCode::Char(c), modifier)
                            if modifier == KeyModifiers::NONE || modifier == KeyModifiers::SHIFT =>
                        {
                            app.input_buffer.push(c);
                        }
                        (KeyCode::Backspace, _) => {
                            app.input_buffer.pop();
                        }
                        (KeyCode::Esc, _) => {
                            app.input_mode = InputMode::Normal;
                            app.input_buffer.clear();
                            app.status_message =
                                "Input cancelled. Press 'Enter' to start typing again.".to_string();
                        }
                        _ => {}
                    },
                },
                _ => {}
            }
        }

        match app.event_receiver.try_recv() {
            Ok(app_event) => {
                debug!(?app_event, "app event");
                app.handle_event(app_event);
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                app.status_message = "Critical Error: Async event channel disconnected.".to_string();
                terminal.draw(|f| ui(f, app))?;
                return Err(AppError::ChannelReceive);
            }
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- UI Drawing Logic ---
fn ui(f: &mut Frame, app: &App) {
    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(25), Constraint::Percentage(75)])
        .split(f.size());

    let connection_state = app.connection.state();
    let connected = match &connection_state {
        ConnectionState::Connected(model) => Some(model),
        _ => None,
    };

    // --- Left side: Models List ---
    let model_items: Vec<ListItem> = app
        .models
        .iter()
        .map(|m| {
            if Some(m) == connected {
                ListItem::new(format!("{} *", m))
            } else {
                ListItem::new(m.as_str())
            }
        })
        .collect();

    let models_list = List::new(model_items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Models (j/k, c: connect, r: refresh, e: eject) "),
        )
        .highlight_style(Style::default().add_modifier(Modifier::BOLD).bg(Color::Blue))
        .highlight_symbol("> ");

    let mut list_state = ListState::default();
    list_state.select(app.selected_model_index);
    f.render_stateful_widget(models_list, main_chunks[0], &mut list_state);

    // --- Right side: Conversation, Input, Status ---
    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(1),
            Constraint::Length(7),
            Constraint::Length(1),
        ])
        .split(main_chunks[1]);

    let mut conversation_content: Vec<Line> = Vec::new();
    for message in app.conversation.history() {
        conversation_content.push(message_header(&message));
        for text_line in message.display_text().lines() {
            conversation_content.push(Line::raw(text_line.to_string()));
        }
        conversation_content.push(Line::from(""));
    }

    let conversation_paragraph = Paragraph::new(conversation_content)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Conversation (PgUp/PgDn, x: cancel) "),
        )
        .wrap(Wrap { trim: false })
        .scroll((app.scroll_offset, 0));
    f.render_widget(conversation_paragraph, right_chunks[0]);

    // --- Input Area ---
    let (input_title, input_block_style) = match app.input_mode {
        InputMode::Editing => (
            " Input (Enter: Newline, Ctrl+S: Send, Esc: Cancel) ",
            Style::default().fg(Color::Yellow),
        ),
        InputMode::Normal => (" Input (Press Enter to type) ", Style::default()),
    };
    let input_paragraph = Paragraph::new(app.input_buffer.as_str())
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(input_title)
                .border_style(input_block_style),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(input_paragraph, right_chunks[1]);

    if let InputMode::Editing = app.input_mode {
        let input_area = right_chunks[1];
        let buffer_char_count = app.input_buffer.chars().count() as u16;
        let input_width = input_area.width.saturating_sub(2).max(1);
        let cursor_x = (input_area.x + 1 + buffer_char_count % input_width)
            .min(input_area.right().saturating_sub(1));
        let cursor_y = (input_area.y + 1 + buffer_char_count / input_width)
            .min(input_area.bottom().saturating_sub(1));
        f.set_cursor(cursor_x, cursor_y);
    }

    // --- Status Bar ---
    let status_style = if app.status_message.to_lowercase().contains("error") {
        Style::default().bg(Color::Red).fg(Color::White)
    } else if app.conversation.is_generating()
        || matches!(connection_state, ConnectionState::Connecting(_))
    {
        Style::default().bg(Color::Yellow).fg(Color::Black)
    } else {
        Style::default().bg(Color::DarkGray).fg(Color::White)
    };
    let status_line = format!(
        "[{}] {}",
        describe_connection(&connection_state),
        app.status_message
    );
    f.render_widget(Paragraph::new(status_line).style(status_style), right_chunks[2]);
}

fn message_header(message: &Message) -> Line<'static> {
    let (sender, style) = match message.role {
        Role::User => (
            "You".to_string(),
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        ),
        Role::System => (
            "System".to_string(),
            Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
        ),
        Role::Assistant => (
            message
                .model
                .as_ref()
                .map_or_else(|| "Model".to_string(), ModelId::to_string),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
    };
    let marker = if message.is_provisional() { " ..." } else { "" };
    Line::styled(format!("{}:{}", sender, marker), style)
}

fn describe_connection(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Disconnected => "disconnected".to_string(),
        ConnectionState::Connecting(model) => format!("connecting {}", model),
        ConnectionState::Connected(model) => format!("connected {}", model),
        ConnectionState::Failed(model, _) => format!("failed {}", model),
    }
}
