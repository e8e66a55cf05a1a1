//! Terminal UI — renders the store and feeds typed lines back into it.
//!
//! Three panes: the chat roster on the left, the selected chat's history on
//! the right, an input line below it. The UI is a plain store subscriber;
//! everything it shows comes from store queries, everything it produces goes
//! through `add_chat_line`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ratatui::crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Modifier, Style};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use ratatui::{DefaultTerminal, Frame};
use tokio::sync::{mpsc, watch};

use parley_core::{Chat, Message};

use crate::store::Store;

enum UiEvent {
    ChatChanged,
    MessageAdded(Message),
}

#[derive(PartialEq)]
enum Focus {
    Roster,
    Input,
}

pub struct Tui {
    store: Arc<Store>,
    events: mpsc::UnboundedReceiver<UiEvent>,
    chats: Vec<Chat>,
    roster_state: ListState,
    current: Option<Chat>,
    unread: HashSet<String>,
    input: String,
    focus: Focus,
}

impl Tui {
    /// Build the UI and subscribe it to the store.
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, events) = mpsc::unbounded_channel();

        let chat_tx = tx.clone();
        store.register_chat_handler(Arc::new(move |_| {
            let _ = chat_tx.send(UiEvent::ChatChanged);
        }));
        store.register_message_handler(Arc::new(move |message| {
            let _ = tx.send(UiEvent::MessageAdded(message));
        }));

        Self {
            store,
            events,
            chats: Vec::new(),
            roster_state: ListState::default(),
            current: None,
            unread: HashSet::new(),
            input: String::new(),
            focus: Focus::Roster,
        }
    }

    /// Run until the user quits or the shutdown signal fires. Blocking;
    /// call from a blocking task.
    pub fn run(mut self, shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let mut terminal = ratatui::init();
        let result = self.event_loop(&mut terminal, shutdown);
        ratatui::restore();
        result
    }

    fn event_loop(
        &mut self,
        terminal: &mut DefaultTerminal,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        self.reload_roster();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.drain_events();
            terminal.draw(|frame| self.draw(frame))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press && self.handle_key(key.code, key.modifiers) {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(ui_event) = self.events.try_recv() {
            match ui_event {
                UiEvent::ChatChanged => self.reload_roster(),
                UiEvent::MessageAdded(message) => match self.current.as_ref() {
                    Some(current) if current.id == message.chat_id => self.reload_current(),
                    _ => {
                        self.unread.insert(message.chat_id);
                    }
                },
            }
        }
    }

    fn reload_roster(&mut self) {
        self.chats = self.store.get_chats();
        self.chats.sort_by(|a, b| a.id.cmp(&b.id));

        if self.chats.is_empty() {
            self.roster_state.select(None);
        } else {
            let selected = self.roster_state.selected().unwrap_or(0);
            self.roster_state
                .select(Some(selected.min(self.chats.len() - 1)));
        }
    }

    fn reload_current(&mut self) {
        if let Some(current) = self.current.as_ref() {
            if let Ok(chat) = self.store.get_chat(&current.id) {
                self.current = Some(chat);
            }
        }
    }

    /// Returns true when the UI should exit.
    fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> bool {
        if code == KeyCode::Esc
            || (code == KeyCode::Char('c') && modifiers.contains(KeyModifiers::CONTROL))
        {
            return true;
        }

        if code == KeyCode::Tab {
            self.focus = match self.focus {
                Focus::Roster => Focus::Input,
                Focus::Input => Focus::Roster,
            };
            return false;
        }

        match self.focus {
            Focus::Roster => match code {
                KeyCode::Up => self.move_selection(-1),
                KeyCode::Down => self.move_selection(1),
                KeyCode::Enter => self.open_selected(),
                _ => {}
            },
            Focus::Input => match code {
                KeyCode::Char(c) => self.input.push(c),
                KeyCode::Backspace => {
                    self.input.pop();
                }
                KeyCode::Enter => self.submit(),
                _ => {}
            },
        }
        false
    }

    fn move_selection(&mut self, delta: isize) {
        if self.chats.is_empty() {
            return;
        }
        let selected = self.roster_state.selected().unwrap_or(0) as isize;
        let next = (selected + delta).clamp(0, self.chats.len() as isize - 1);
        self.roster_state.select(Some(next as usize));
    }

    fn open_selected(&mut self) {
        let Some(index) = self.roster_state.selected() else {
            return;
        };
        let Some(chat) = self.chats.get(index) else {
            return;
        };
        if let Ok(chat) = self.store.get_chat(&chat.id) {
            self.unread.remove(&chat.id);
            self.current = Some(chat);
            self.focus = Focus::Input;
        }
    }

    fn submit(&mut self) {
        let text = self.input.trim().to_string();
        self.input.clear();
        if text.is_empty() {
            return;
        }
        let Some(chat) = self.current.as_ref() else {
            return;
        };

        let message = Message::new(
            chat.id.clone(),
            self.store.current_user().id.clone(),
            text,
            Utc::now(),
        );
        if let Err(e) = self.store.add_chat_line(message) {
            tracing::warn!(error = %e, "failed to store the typed message");
        }
        self.reload_current();
    }

    fn draw(&mut self, frame: &mut Frame) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
            .split(frame.area());
        let right = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(3)])
            .split(columns[1]);

        let roster_items: Vec<ListItem> = self
            .chats
            .iter()
            .map(|chat| ListItem::new(roster_label(chat, self.unread.contains(&chat.id))))
            .collect();
        let roster = List::new(roster_items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("Users({})", self.store.current_user().name)),
            )
            .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
        frame.render_stateful_widget(roster, columns[0], &mut self.roster_state);

        let history_height = right[0].height.saturating_sub(2) as usize;
        let (title, lines) = match self.current.as_ref() {
            Some(chat) => (
                roster_label(chat, false),
                chat.content
                    .iter()
                    .rev()
                    .take(history_height)
                    .rev()
                    .map(message_line)
                    .collect::<Vec<_>>(),
            ),
            None => (String::from("Chat"), Vec::new()),
        };
        let history: Vec<ListItem> = lines.into_iter().map(ListItem::new).collect();
        let history =
            List::new(history).block(Block::default().borders(Borders::ALL).title(title));
        frame.render_widget(history, right[0]);

        let input = Paragraph::new(self.input.as_str())
            .block(Block::default().borders(Borders::ALL).title("Message"));
        frame.render_widget(input, right[1]);

        if self.focus == Focus::Input {
            frame.set_cursor_position((
                right[1].x + self.input.len() as u16 + 1,
                right[1].y + 1,
            ));
        }
    }
}

fn roster_label(chat: &Chat, unread: bool) -> String {
    let names: Vec<&str> = chat.users.iter().map(|u| u.name.as_str()).collect();
    let mut label = names.join(",");
    if chat.offline {
        label.push_str(" (offline)");
    }
    if unread {
        label.insert_str(0, "# ");
    }
    label
}

fn message_line(message: &Message) -> String {
    if message.error_message {
        message.text.clone()
    } else {
        format!(
            "{} ({}): {}",
            message.user_name,
            message.at.format("%b %e %H:%M:%S"),
            message.text
        )
    }
}
