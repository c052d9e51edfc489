//! Handler tables for inbound commands.
//!
//! A table is built once per protocol and shared read-only by every
//! connection speaking it. Lookups:
//!
//! | Key                                  | Used for                              |
//! |--------------------------------------|---------------------------------------|
//! | (outgoing verb, incoming verb)       | reply to a matched transaction        |
//! | (none, incoming verb)                | unsolicited command, or fallback      |
//! | outgoing verb                        | error reply to that verb              |
//! | content type                         | payload of a MIME-carrying verb       |

use std::collections::{HashMap, HashSet};

use super::command::Command;
use super::frame::CommandGrammar;
use super::mime::MimeMessage;
use super::transaction::{TransactionError, TransactionInfo};

/// Handler for a command line.
pub type CommandHandler<S> = Box<dyn Fn(&mut S, &Command) + Send + Sync>;

/// Handler for a failed transaction with no error callback of its own.
pub type ErrorHandler<S> = Box<dyn Fn(&mut S, &TransactionInfo, &TransactionError) + Send + Sync>;

/// Handler for a MIME payload, keyed by content type.
pub type PayloadHandler<S> = Box<dyn Fn(&mut S, &Command, &MimeMessage) + Send + Sync>;

/// Handlers for one protocol.
pub struct DispatchTable<S> {
    grammar: CommandGrammar,
    commands: HashMap<(Option<String>, String), CommandHandler<S>>,
    errors: HashMap<String, ErrorHandler<S>>,
    payloads: HashMap<String, PayloadHandler<S>>,
    payload_verbs: HashSet<String>,
}

impl<S> DispatchTable<S> {
    /// Empty table over `grammar`.
    pub fn new(grammar: CommandGrammar) -> Self {
        Self {
            grammar,
            commands: HashMap::new(),
            errors: HashMap::new(),
            payloads: HashMap::new(),
            payload_verbs: HashSet::new(),
        }
    }

    /// Grammar the frame reader uses for this protocol
    pub fn grammar(&self) -> &CommandGrammar {
        &self.grammar
    }

    /// Register a handler for `verb` arriving in `context`.
    ///
    /// `context` is the outgoing verb of the transaction the command answers;
    /// `None` matches unsolicited commands and acts as fallback.
    pub fn add_command<F>(&mut self, context: Option<&str>, verb: &str, handler: F)
    where
        F: Fn(&mut S, &Command) + Send + Sync + 'static,
    {
        self.commands.insert(
            (context.map(str::to_string), verb.to_string()),
            Box::new(handler),
        );
    }

    /// Register the error handler for transactions sent as `verb`.
    pub fn add_error<F>(&mut self, verb: &str, handler: F)
    where
        F: Fn(&mut S, &TransactionInfo, &TransactionError) + Send + Sync + 'static,
    {
        self.errors.insert(verb.to_string(), Box::new(handler));
    }

    /// Register a handler for payloads of `content_type`.
    pub fn add_payload<F>(&mut self, content_type: &str, handler: F)
    where
        F: Fn(&mut S, &Command, &MimeMessage) + Send + Sync + 'static,
    {
        self.payloads
            .insert(content_type.to_ascii_lowercase(), Box::new(handler));
    }

    /// Route `verb`'s payload by content type instead of by verb.
    pub fn add_payload_verb(&mut self, verb: &str) {
        self.payload_verbs.insert(verb.to_string());
    }

    /// Handler for `verb` in `context`, falling back to the context-free entry.
    pub fn command(&self, context: Option<&str>, verb: &str) -> Option<&CommandHandler<S>> {
        if let Some(ctx) = context {
            let key = (Some(ctx.to_string()), verb.to_string());
            if let Some(handler) = self.commands.get(&key) {
                return Some(handler);
            }
        }
        self.commands.get(&(None, verb.to_string()))
    }

    /// Error handler for transactions sent as `verb`
    pub fn error(&self, verb: &str) -> Option<&ErrorHandler<S>> {
        self.errors.get(verb)
    }

    /// Handler for `content_type` (parameters already stripped)
    pub fn payload(&self, content_type: &str) -> Option<&PayloadHandler<S>> {
        self.payloads.get(content_type)
    }

    /// Whether `verb` carries a MIME payload routed by content type
    pub fn is_payload_verb(&self, verb: &str) -> bool {
        self.payload_verbs.contains(verb)
    }
}

impl<S> std::fmt::Debug for DispatchTable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("commands", &self.commands.len())
            .field("errors", &self.errors.len())
            .field("payloads", &self.payloads.len())
            .finish()
    }
}
