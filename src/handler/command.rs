//! The command vocabulary.
//!
//! Each command reads its payload fields in a fixed order, performs one
//! operation on the [`WorkerState`] and returns at most one reply carrying
//! the incoming id. Errors are returned, not replied; the dispatcher turns
//! them into `error` replies.
//!
//! | command | fields | reply |
//! |---|---|---|
//! | `execute` | source | `execute_response` (stdout, stderr) |
//! | `putFlowVariables` | name, table | `success` |
//! | `getFlowVariables` | name | table bytes |
//! | `putTable` | name, table | `success` |
//! | `appendToTable` | name, table | `success` |
//! | `getTableSize` | name | integer |
//! | `getTable` | name | table bytes |
//! | `getTableChunk` | name, start, end | table bytes |
//! | `listVariables` | | table bytes |
//! | `reset` | | `success` |
//! | `hasAutoComplete` | | integer |
//! | `autoComplete` | source, line, column | table bytes |
//! | `getImage` | name | image bytes |
//! | `getObject` | name | table bytes |
//! | `putObject` | name, object bytes | `success` |
//! | `addSerializer` | id, type, path | `success` |
//! | `addDeserializer` | id, path | `success` |
//! | `shutdown` | | none |
//! | `putSql` | name, table | `success` |
//! | `getSql` | name | string |
//! | `setCustomModulePaths` | path | `success` |
//! | `getpid` | | integer |
//!
//! Value replies are named `<command>_response`.

use super::CommandContext;
use crate::error::{KernelError, Result};
use crate::kernel::{Cell, ObjectValue, SqlBinding, Table, Value, WorkerState};
use crate::protocol::{commands, Message, MessageId, PayloadReader};

/// Type name given to objects put by the host.
pub const HOST_OBJECT_TYPE: &str = "object";

/// A command the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Execute,
    PutFlowVariables,
    GetFlowVariables,
    PutTable,
    AppendToTable,
    GetTableSize,
    GetTable,
    GetTableChunk,
    ListVariables,
    Reset,
    HasAutoComplete,
    AutoComplete,
    GetImage,
    GetObject,
    PutObject,
    AddSerializer,
    AddDeserializer,
    Shutdown,
    PutSql,
    GetSql,
    SetCustomModulePaths,
    GetPid,
}

impl Command {
    /// Every command, in wire vocabulary order.
    pub const ALL: [Command; 22] = [
        Command::Execute,
        Command::PutFlowVariables,
        Command::GetFlowVariables,
        Command::PutTable,
        Command::AppendToTable,
        Command::GetTableSize,
        Command::GetTable,
        Command::GetTableChunk,
        Command::ListVariables,
        Command::Reset,
        Command::HasAutoComplete,
        Command::AutoComplete,
        Command::GetImage,
        Command::GetObject,
        Command::PutObject,
        Command::AddSerializer,
        Command::AddDeserializer,
        Command::Shutdown,
        Command::PutSql,
        Command::GetSql,
        Command::SetCustomModulePaths,
        Command::GetPid,
    ];

    /// Name on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Command::Execute => "execute",
            Command::PutFlowVariables => "putFlowVariables",
            Command::GetFlowVariables => "getFlowVariables",
            Command::PutTable => "putTable",
            Command::AppendToTable => "appendToTable",
            Command::GetTableSize => "getTableSize",
            Command::GetTable => "getTable",
            Command::GetTableChunk => "getTableChunk",
            Command::ListVariables => "listVariables",
            Command::Reset => "reset",
            Command::HasAutoComplete => "hasAutoComplete",
            Command::AutoComplete => "autoComplete",
            Command::GetImage => "getImage",
            Command::GetObject => "getObject",
            Command::PutObject => "putObject",
            Command::AddSerializer => "addSerializer",
            Command::AddDeserializer => "addDeserializer",
            Command::Shutdown => "shutdown",
            Command::PutSql => "putSql",
            Command::GetSql => "getSql",
            Command::SetCustomModulePaths => "setCustomModulePaths",
            Command::GetPid => "getpid",
        }
    }

    /// Look a command up by its wire name (case-sensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Whether the host gets a reply.
    pub fn replies(self) -> bool {
        !matches!(self, Command::Shutdown)
    }

    /// Name of the reply for value-returning commands.
    pub fn response_name(self) -> String {
        format!("{}{}", self.name(), commands::RESPONSE_SUFFIX)
    }

    /// Run the command.
    ///
    /// May send nested requests through `ctx` and wait for them; the read
    /// loop keeps running meanwhile.
    pub async fn execute(
        self,
        ctx: &CommandContext,
        state: &dyn WorkerState,
    ) -> Result<Option<Message>> {
        let id = ctx.id();
        let mut payload = ctx.payload();

        let reply = match self {
            Command::Execute => {
                let source = payload.read_string()?;
                let output = state.execute(&source)?;
                Message::execute_response(id, &output.stdout, &output.stderr)?
            }

            Command::PutFlowVariables => {
                let name = payload.read_string()?;
                let table = state.decode_table(&payload.read_bytes()?)?;
                state.put_variable(&name, Value::FlowVariables(table.to_flow_variables()))?;
                Message::success(id)
            }

            Command::GetFlowVariables => {
                let name = payload.read_string()?;
                let table = match state.get_variable(&name)? {
                    Value::FlowVariables(vars) => Table::from_flow_variables(&vars),
                    other => return Err(unexpected("flow variables", &other)),
                };
                self.bytes_reply(id, &state.encode_table(&table)?)?
            }

            Command::PutTable => {
                let name = payload.read_string()?;
                let table = state.decode_table(&payload.read_bytes()?)?;
                resolve_deserializers(ctx, state, &table).await?;
                state.put_variable(&name, Value::Table(table))?;
                Message::success(id)
            }

            Command::AppendToTable => {
                let name = payload.read_string()?;
                let table = state.decode_table(&payload.read_bytes()?)?;
                resolve_deserializers(ctx, state, &table).await?;
                state.append_to_table(&name, table)?;
                Message::success(id)
            }

            Command::GetTableSize => {
                let name = payload.read_string()?;
                let table = expect_table(state, &name)?;
                let size = i32::try_from(table.len()).map_err(|_| {
                    KernelError::domain(format!("Table {} has too many rows to report", name))
                })?;
                Message::integer(id, &self.response_name(), size)?
            }

            Command::GetTable => {
                let name = payload.read_string()?;
                let table = expect_table(state, &name)?;
                resolve_serializers(ctx, state, &table).await?;
                self.bytes_reply(id, &state.encode_table(&table)?)?
            }

            Command::GetTableChunk => {
                let name = payload.read_string()?;
                let start = payload.read_integer()?;
                let end = payload.read_integer()?;
                let chunk = expect_table(state, &name)?.slice(start, end)?;
                resolve_serializers(ctx, state, &chunk).await?;
                self.bytes_reply(id, &state.encode_table(&chunk)?)?
            }

            Command::ListVariables => {
                let mut table = Table::with_columns(&["name", "type", "value"]);
                for info in state.list_variables() {
                    table.push_row(vec![
                        Cell::from(info.name),
                        Cell::from(info.type_name),
                        Cell::from(info.value),
                    ])?;
                }
                self.bytes_reply(id, &state.encode_table(&table)?)?
            }

            Command::Reset => {
                state.reset();
                Message::success(id)
            }

            Command::HasAutoComplete => {
                let value = if state.has_auto_complete() { 1 } else { 0 };
                Message::integer(id, &self.response_name(), value)?
            }

            Command::AutoComplete => {
                let source = payload.read_string()?;
                let line = payload.read_integer()?;
                let column = payload.read_integer()?;
                let mut table = Table::with_columns(&["name", "type", "doc"]);
                for suggestion in state.auto_complete(&source, line, column) {
                    table.push_row(vec![
                        Cell::from(suggestion.name),
                        Cell::from(suggestion.type_name),
                        Cell::from(suggestion.doc),
                    ])?;
                }
                self.bytes_reply(id, &state.encode_table(&table)?)?
            }

            Command::GetImage => {
                let name = payload.read_string()?;
                // Anything that is not an image, including nothing, is an empty image
                let image = match state.get_variable(&name) {
                    Ok(Value::Image(bytes)) => bytes,
                    _ => Vec::new(),
                };
                self.bytes_reply(id, &image)?
            }

            Command::GetObject => {
                let name = payload.read_string()?;
                let value = state.get_variable(&name)?;
                let representation = value.representation();
                let object = match value {
                    Value::Object(object) => object,
                    other => return Err(unexpected("an object", &other)),
                };
                let table = Table::with_columns(&["bytes", "type", "representation"]).with_row(
                    vec![
                        Cell::Bytes(object.bytes),
                        Cell::from(object.type_name),
                        Cell::from(representation),
                    ],
                )?;
                self.bytes_reply(id, &state.encode_table(&table)?)?
            }

            Command::PutObject => {
                let name = payload.read_string()?;
                let bytes = payload.read_bytes()?;
                let object = ObjectValue {
                    type_name: HOST_OBJECT_TYPE.to_string(),
                    bytes: bytes.to_vec(),
                };
                state.put_variable(&name, Value::Object(object))?;
                Message::success(id)
            }

            Command::AddSerializer => {
                let extension = payload.read_string()?;
                let type_name = payload.read_string()?;
                let path = payload.read_string()?;
                state.add_serializer(&extension, &type_name, &path)?;
                Message::success(id)
            }

            Command::AddDeserializer => {
                let extension = payload.read_string()?;
                let path = payload.read_string()?;
                state.add_deserializer(&extension, &path)?;
                Message::success(id)
            }

            Command::Shutdown => {
                state.cleanup();
                ctx.shutdown();
                return Ok(None);
            }

            Command::PutSql => {
                let name = payload.read_string()?;
                let settings = state.decode_table(&payload.read_bytes()?)?;
                state.put_variable(&name, Value::Sql(SqlBinding::from_settings(settings)?))?;
                Message::success(id)
            }

            Command::GetSql => {
                let name = payload.read_string()?;
                let binding = match state.get_variable(&name)? {
                    Value::Sql(binding) => binding,
                    other => return Err(unexpected("a database binding", &other)),
                };
                Message::string(id, &self.response_name(), &binding.output_query)?
            }

            Command::SetCustomModulePaths => {
                let path = payload.read_string()?;
                state.add_module_path(&path)?;
                Message::success(id)
            }

            Command::GetPid => {
                let pid = i32::try_from(state.process_id())
                    .map_err(|_| KernelError::domain("Process id does not fit an integer field"))?;
                Message::integer(id, &self.response_name(), pid)?
            }
        };

        Ok(Some(reply))
    }

    fn bytes_reply(self, id: MessageId, data: &[u8]) -> Result<Message> {
        Message::bytes(id, &self.response_name(), data)
    }
}

fn expect_table(state: &dyn WorkerState, name: &str) -> Result<Table> {
    match state.get_variable(name)? {
        Value::Table(table) => Ok(table),
        other => Err(unexpected("a table", &other)),
    }
}

fn unexpected(expected: &str, got: &Value) -> KernelError {
    KernelError::domain(format!("Expected {}, got: {}", expected, got.type_name()))
}

/// Ask the host for deserializers the table's columns need.
async fn resolve_deserializers(
    ctx: &CommandContext,
    state: &dyn WorkerState,
    table: &Table,
) -> Result<()> {
    for extension in table.extension_ids() {
        if state.deserializer(extension).is_some() {
            continue;
        }
        let reply = ctx
            .request_reply(|id| Message::deserializer_request(id, extension))
            .await?;
        let path = PayloadReader::new(reply.payload_bytes()).read_string()?;
        if path.is_empty() {
            return Err(KernelError::domain(format!(
                "No deserializer available for type extension {}",
                extension
            )));
        }
        state.add_deserializer(extension, &path)?;
    }
    Ok(())
}

/// Ask the host for serializers the table's columns need.
async fn resolve_serializers(
    ctx: &CommandContext,
    state: &dyn WorkerState,
    table: &Table,
) -> Result<()> {
    for extension in table.extension_ids() {
        if state.serializer(extension).is_some() {
            continue;
        }
        let reply = ctx
            .request_reply(|id| Message::serializer_request(id, extension))
            .await?;
        let mut fields = PayloadReader::new(reply.payload_bytes());
        let type_name = fields.read_string()?;
        let path = fields.read_string()?;
        if path.is_empty() {
            return Err(KernelError::domain(format!(
                "No serializer available for type extension {}",
                extension
            )));
        }
        state.add_serializer(extension, &type_name, &path)?;
    }
    Ok(())
}
