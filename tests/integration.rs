//! Integration tests for kernel-link.
//!
//! A fake host talks to a running dispatcher over an in-memory duplex
//! stream, using the crate's own framing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use kernel_link::kernel::{
    Cell, Column, ExecutionOutput, MemoryKernel, ScriptEngine, SqlBinding, Table, TableCodec,
    Value, Variables, WorkerState,
};
use kernel_link::protocol::{
    build_frame, commands, FramePrefix, Message, MessageId, PayloadBuilder, PayloadReader,
};
use kernel_link::transport::MessageReader;
use kernel_link::{Dispatcher, DispatcherBuilder, DispatcherHandle, KernelError, Result};

const STEP: Duration = Duration::from_secs(5);

/// Host end of the connection.
struct Host {
    reader: MessageReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Host {
    async fn send(&mut self, message: &Message) {
        self.write_raw(&build_frame(message).unwrap()).await;
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(STEP, self.reader.read_message())
            .await
            .expect("no message from worker")
            .unwrap()
    }

    /// Receive `n` messages and order them by id.
    async fn recv_sorted(&mut self, n: usize) -> Vec<Message> {
        let mut messages = Vec::with_capacity(n);
        for _ in 0..n {
            messages.push(self.recv().await);
        }
        messages.sort_by_key(|m| m.id());
        messages
    }
}

struct Worker {
    handle: DispatcherHandle,
    task: JoinHandle<Result<()>>,
}

fn start(builder: DispatcherBuilder, state: Arc<dyn WorkerState>) -> (Host, Worker) {
    let (host_side, worker_side) = duplex(1 << 20);

    let (reader, writer) = tokio::io::split(worker_side);
    let dispatcher = builder.start(reader, writer, state);
    let handle = dispatcher.handle();
    let task = tokio::spawn(dispatcher.run());

    let (reader, writer) = tokio::io::split(host_side);
    let host = Host {
        reader: MessageReader::new(reader),
        writer,
    };
    (host, Worker { handle, task })
}

fn start_default(state: Arc<dyn WorkerState>) -> (Host, Worker) {
    start(Dispatcher::builder(), state)
}

fn command(id: MessageId, name: &str, fields: impl FnOnce(&mut PayloadBuilder)) -> Message {
    let mut payload = PayloadBuilder::new();
    fields(&mut payload);
    Message::new(id, name)
        .unwrap()
        .into_request()
        .with_payload(payload.finish().unwrap())
}

fn numbers_table(rows: i64) -> Table {
    let mut table = Table::with_columns(&["n"]);
    for i in 0..rows {
        table.push_row(vec![Cell::Integer(i)]).unwrap();
    }
    table
}

fn read_string(message: &Message) -> String {
    PayloadReader::new(message.payload_bytes()).read_string().unwrap()
}

fn read_table(message: &Message) -> Table {
    let bytes = PayloadReader::new(message.payload_bytes()).read_bytes().unwrap();
    TableCodec::decode(&bytes).unwrap()
}

#[tokio::test]
async fn test_getpid_yields_one_reply_with_same_id() {
    let (mut host, _worker) = start_default(Arc::new(MemoryKernel::new()));

    host.send(&command(7, "getpid", |_| {})).await;
    let reply = host.recv().await;

    assert_eq!(reply.id(), 7);
    assert_eq!(reply.command(), "getpid_response");
    let pid = PayloadReader::new(reply.payload_bytes()).read_integer().unwrap();
    assert_eq!(pid as u32, std::process::id());

    // The next message seen belongs to the next command
    host.send(&command(8, "getpid", |_| {})).await;
    assert_eq!(host.recv().await.id(), 8);
}

#[tokio::test]
async fn test_unknown_command_does_not_stop_loop() {
    let (mut host, _worker) = start_default(Arc::new(MemoryKernel::new()));

    host.send(&Message::new(1, "frobnicate").unwrap()).await;
    host.send(&command(2, "frobnicate", |_| {})).await;
    // A late answer to a request nobody waits for is dropped silently
    host.send(&Message::integer(3, "serializer_response", 0).unwrap())
        .await;
    host.send(&command(4, "getpid", |_| {})).await;

    let replies = host.recv_sorted(3).await;
    let ids: Vec<_> = replies.iter().map(|m| m.id()).collect();
    assert_eq!(ids, vec![1, 2, 4]);
    for reply in &replies[..2] {
        assert_eq!(reply.command(), commands::ERROR);
        assert!(read_string(reply).contains("frobnicate"));
    }
    assert_eq!(replies[2].command(), "getpid_response");
}

#[tokio::test]
async fn test_malformed_header_is_skipped() {
    let (mut host, _worker) = start_default(Arc::new(MemoryKernel::new()));

    let header = b"@command=getpid@request=true";
    let mut bytes = FramePrefix::new(header.len(), 0).unwrap().encode().to_vec();
    bytes.extend_from_slice(header);
    host.write_raw(&bytes).await;
    host.send(&command(4, "getpid", |_| {})).await;

    assert_eq!(host.recv().await.id(), 4);
}

#[tokio::test]
async fn test_nested_request_stays_live() {
    let kernel = Arc::new(MemoryKernel::new());
    let builder = Dispatcher::builder().max_concurrent_handlers(2);
    let (mut host, _worker) = start(builder, kernel.clone());

    let table = Table::new(vec![Column::with_extension("when", "org.example.date")])
        .with_row(vec![Cell::Integer(1_700_000_000)])
        .unwrap();
    let bytes = TableCodec::encode(&table).unwrap();
    host.send(&command(10, "putTable", |p| {
        p.add_string("input").add_bytes(&bytes);
    }))
    .await;

    // The handler asks for the deserializer and waits
    let nested = host.recv().await;
    assert_eq!(nested.command(), commands::DESERIALIZER_REQUEST);
    assert!(nested.is_data_request());
    assert!(nested.id() >= kernel_link::dispatcher::DEFAULT_FIRST_MESSAGE_ID);
    assert_eq!(read_string(&nested), "org.example.date");

    // Unrelated commands are served in the meantime
    host.send(&command(11, "getpid", |_| {})).await;
    host.send(&command(12, "getpid", |_| {})).await;
    let served = host.recv_sorted(2).await;
    assert_eq!(served[0].id(), 11);
    assert_eq!(served[1].id(), 12);

    host.send(&Message::string(nested.id(), "deserializer_response", "/ext/date.py").unwrap())
        .await;

    let reply = host.recv().await;
    assert_eq!(reply.id(), 10);
    assert_eq!(reply.command(), commands::SUCCESS);
    assert_eq!(
        kernel.deserializer("org.example.date").as_deref(),
        Some("/ext/date.py")
    );
    assert_eq!(kernel.get_variable("input").unwrap(), Value::Table(table));
}

#[tokio::test]
async fn test_nested_request_unknown_extension_fails_command() {
    let (mut host, _worker) = start_default(Arc::new(MemoryKernel::new()));

    let table = Table::new(vec![Column::with_extension("x", "org.example.unknown")]);
    let bytes = TableCodec::encode(&table).unwrap();
    host.send(&command(13, "appendToTable", |p| {
        p.add_string("t").add_bytes(&bytes);
    }))
    .await;

    let nested = host.recv().await;
    host.send(&Message::string(nested.id(), "deserializer_response", "").unwrap())
        .await;

    let reply = host.recv().await;
    assert_eq!(reply.id(), 13);
    assert_eq!(reply.command(), commands::ERROR);
    assert!(read_string(&reply).contains("org.example.unknown"));
}

#[tokio::test]
async fn test_get_table_asks_for_serializer() {
    let kernel = Arc::new(MemoryKernel::new());
    let table = Table::new(vec![Column::new("id"), Column::with_extension("at", "org.example.date")])
        .with_row(vec![Cell::Integer(1), Cell::Integer(99)])
        .unwrap();
    kernel.put_variable("out", Value::Table(table.clone())).unwrap();
    let (mut host, _worker) = start_default(kernel.clone());

    host.send(&command(14, "getTable", |p| {
        p.add_string("out");
    }))
    .await;

    let nested = host.recv().await;
    assert_eq!(nested.command(), commands::SERIALIZER_REQUEST);
    let mut reply = PayloadBuilder::new();
    reply.add_string("datetime").add_string("/ext/date_ser.py");
    host.send(
        &Message::new(nested.id(), "serializer_response")
            .unwrap()
            .with_payload(reply.finish().unwrap()),
    )
    .await;

    let reply = host.recv().await;
    assert_eq!(reply.id(), 14);
    assert_eq!(reply.command(), "getTable_response");
    assert_eq!(read_table(&reply), table);
    assert_eq!(kernel.serializer("org.example.date").unwrap().type_name, "datetime");
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let (mut host, worker) = start_default(Arc::new(MemoryKernel::new()));
    const N: usize = 16;

    let mut waiters = Vec::new();
    for _ in 0..N {
        let handle = worker.handle.clone();
        waiters.push(tokio::spawn(async move {
            let id = handle.next_message_id();
            let answer = handle
                .request(Message::new(id, "ping").unwrap())
                .await
                .unwrap();
            let reply = answer.wait().await.unwrap();
            (id, reply)
        }));
    }

    let requests = host.recv_sorted(N).await;
    for request in requests.iter().rev() {
        let value = (request.id() - kernel_link::dispatcher::DEFAULT_FIRST_MESSAGE_ID) as i32;
        host.send(&Message::integer(request.id(), "pong", value).unwrap())
            .await;
    }

    for waiter in waiters {
        let (id, reply) = waiter.await.unwrap();
        assert_eq!(reply.id(), id);
        let value = PayloadReader::new(reply.payload_bytes()).read_integer().unwrap();
        assert_eq!(value as u32 + kernel_link::dispatcher::DEFAULT_FIRST_MESSAGE_ID, id);
    }
    assert_eq!(worker.handle.pending_requests(), 0);
}

#[tokio::test]
async fn test_shutdown_command_stops_without_reply() {
    let kernel = Arc::new(MemoryKernel::new());
    let settings = Table::with_columns(&["query"])
        .with_row(vec![Cell::from("SELECT 1")])
        .unwrap();
    kernel
        .put_variable("db", Value::Sql(SqlBinding::from_settings(settings).unwrap()))
        .unwrap();
    let (mut host, worker) = start_default(kernel.clone());

    host.send(&Message::new(20, "shutdown").unwrap()).await;

    let result = tokio::time::timeout(STEP, worker.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(kernel.get_variable("db").is_err());

    // The stream is closed once run returns, without a reply to shutdown
    let end = tokio::time::timeout(STEP, host.reader.read_message())
        .await
        .unwrap();
    assert!(matches!(end, Err(KernelError::ConnectionClosed)));
}

#[tokio::test]
async fn test_replies_are_written_before_run_returns() {
    // Small pipe: the worker cannot get ahead of the host
    let (host_side, worker_side) = duplex(128);
    let (reader, writer) = tokio::io::split(worker_side);
    let dispatcher =
        Dispatcher::builder().start(reader, writer, Arc::new(MemoryKernel::new()));
    let handle = dispatcher.handle();
    let task = tokio::spawn(dispatcher.run());

    let (host_reader, mut host_writer) = tokio::io::split(host_side);
    let collector = tokio::spawn(async move {
        let mut reader = MessageReader::new(host_reader);
        let mut received = Vec::new();
        loop {
            match reader.read_message().await {
                Ok(message) => received.push(message),
                Err(KernelError::ConnectionClosed) => return received,
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
    });

    let mut batch = Vec::new();
    for id in 0..20 {
        batch.extend(build_frame(&command(id, "getpid", |_| {})).unwrap());
    }
    batch.extend(build_frame(&Message::new(20, "shutdown").unwrap()).unwrap());
    host_writer.write_all(&batch).await.unwrap();

    let result = tokio::time::timeout(STEP, task).await.unwrap().unwrap();
    assert!(result.is_ok());

    // A live handle does not keep the stream open
    let mut received = tokio::time::timeout(STEP, collector).await.unwrap().unwrap();
    received.sort_by_key(|m| m.id());
    let ids: Vec<_> = received.iter().map(|m| m.id()).collect();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
    assert!(received.iter().all(|m| m.command() == "getpid_response"));

    assert!(matches!(
        handle.reply(Message::success(99)).await,
        Err(KernelError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_end_of_stream_fails_pending_requests() {
    let (host, worker) = start_default(Arc::new(MemoryKernel::new()));

    let id = worker.handle.next_message_id();
    let answer = worker
        .handle
        .request(Message::new(id, "ping").unwrap())
        .await
        .unwrap();

    drop(host);

    let result = tokio::time::timeout(STEP, worker.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(matches!(answer.wait().await, Err(KernelError::ConnectionClosed)));
}

#[tokio::test]
async fn test_framing_error_ends_loop() {
    let (mut host, worker) = start_default(Arc::new(MemoryKernel::new()));

    host.write_raw(&[0x80, 0, 0, 0, 0, 0, 0, 0]).await;

    let result = tokio::time::timeout(STEP, worker.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(KernelError::Framing(_))));
}

#[tokio::test]
async fn test_handle_shutdown_interrupts_idle_loop() {
    let (_host, worker) = start_default(Arc::new(MemoryKernel::new()));

    worker.handle.shutdown();

    let result = tokio::time::timeout(STEP, worker.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

struct Echo;

impl ScriptEngine for Echo {
    fn execute(&self, source: &str, variables: &mut Variables) -> Result<ExecutionOutput> {
        variables.insert("source".to_string(), Value::Scalar(Cell::from(source)));
        Ok(ExecutionOutput {
            stdout: format!("ran {} bytes", source.len()),
            stderr: String::new(),
        })
    }
}

#[tokio::test]
async fn test_execute_returns_output_and_error() {
    let kernel = Arc::new(MemoryKernel::with_engine(Echo));
    let (mut host, _worker) = start_default(kernel.clone());

    host.send(&command(30, "execute", |p| {
        p.add_string("print(1)");
    }))
    .await;

    let reply = host.recv().await;
    assert_eq!(reply.id(), 30);
    assert_eq!(reply.command(), commands::EXECUTE_RESPONSE);
    let mut fields = PayloadReader::new(reply.payload_bytes());
    assert_eq!(fields.read_string().unwrap(), "ran 8 bytes");
    assert_eq!(fields.read_string().unwrap(), "");
    assert_eq!(
        kernel.get_variable("source").unwrap(),
        Value::Scalar(Cell::from("print(1)"))
    );
}

#[tokio::test]
async fn test_table_commands() {
    let kernel = Arc::new(MemoryKernel::new());
    let (mut host, _worker) = start_default(kernel.clone());

    let bytes = TableCodec::encode(&numbers_table(10)).unwrap();
    host.send(&command(40, "putTable", |p| {
        p.add_string("data").add_bytes(&bytes);
    }))
    .await;
    assert_eq!(host.recv().await.command(), commands::SUCCESS);

    let more = TableCodec::encode(&numbers_table(5)).unwrap();
    host.send(&command(41, "appendToTable", |p| {
        p.add_string("data").add_bytes(&more);
    }))
    .await;
    assert_eq!(host.recv().await.command(), commands::SUCCESS);

    host.send(&command(42, "getTableSize", |p| {
        p.add_string("data");
    }))
    .await;
    let size = host.recv().await;
    assert_eq!(PayloadReader::new(size.payload_bytes()).read_integer().unwrap(), 15);

    host.send(&command(43, "getTableChunk", |p| {
        p.add_string("data").add_integer(2).add_integer(4);
    }))
    .await;
    let chunk = read_table(&host.recv().await);
    assert_eq!(chunk.len(), 3);
    assert_eq!(chunk.row_offset(), 2);
    assert_eq!(chunk.rows()[0][0], Cell::Integer(2));
}

#[tokio::test]
async fn test_domain_error_becomes_error_reply() {
    let (mut host, _worker) = start_default(Arc::new(MemoryKernel::new()));

    host.send(&command(50, "getTableSize", |p| {
        p.add_string("missing");
    }))
    .await;

    let reply = host.recv().await;
    assert_eq!(reply.id(), 50);
    assert_eq!(reply.command(), commands::ERROR);
    assert!(read_string(&reply).contains("missing"));
}

#[tokio::test]
async fn test_truncated_payload_becomes_error_reply() {
    let (mut host, _worker) = start_default(Arc::new(MemoryKernel::new()));

    let message = Message::new(51, "getTableChunk")
        .unwrap()
        .into_request()
        .with_payload(Bytes::from_static(&[0, 0, 0, 1, b'x', 0, 0]));
    host.send(&message).await;

    let reply = host.recv().await;
    assert_eq!(reply.id(), 51);
    assert_eq!(reply.command(), commands::ERROR);
}

#[tokio::test]
async fn test_variable_commands() {
    let kernel = Arc::new(MemoryKernel::new());
    let (mut host, _worker) = start_default(kernel.clone());

    let mut vars = std::collections::BTreeMap::new();
    vars.insert("alpha".to_string(), Cell::Double(0.5));
    let flow = TableCodec::encode(&Table::from_flow_variables(&vars)).unwrap();
    host.send(&command(60, "putFlowVariables", |p| {
        p.add_string("flow").add_bytes(&flow);
    }))
    .await;
    assert_eq!(host.recv().await.id(), 60);

    host.send(&command(61, "getFlowVariables", |p| {
        p.add_string("flow");
    }))
    .await;
    assert_eq!(read_table(&host.recv().await).to_flow_variables(), vars);

    host.send(&command(62, "putObject", |p| {
        p.add_string("model").add_bytes(&[9, 9, 9]);
    }))
    .await;
    assert_eq!(host.recv().await.id(), 62);

    host.send(&command(63, "getObject", |p| {
        p.add_string("model");
    }))
    .await;
    let object = read_table(&host.recv().await);
    assert_eq!(object.rows()[0][0], Cell::Bytes(vec![9, 9, 9]));
    assert_eq!(object.rows()[0][1], Cell::from("object"));

    host.send(&command(64, "listVariables", |_| {})).await;
    let listed = read_table(&host.recv().await);
    let names: Vec<_> = listed.rows().iter().map(|r| r[0].clone()).collect();
    assert_eq!(names, vec![Cell::from("flow"), Cell::from("model")]);

    host.send(&command(65, "getImage", |p| {
        p.add_string("model");
    }))
    .await;
    let image = host.recv().await;
    assert!(PayloadReader::new(image.payload_bytes()).read_bytes().unwrap().is_empty());

    host.send(&command(66, "reset", |_| {})).await;
    assert_eq!(host.recv().await.command(), commands::SUCCESS);
    assert!(kernel.list_variables().is_empty());
}

#[tokio::test]
async fn test_configuration_commands() {
    let kernel = Arc::new(MemoryKernel::new());
    let (mut host, _worker) = start_default(kernel.clone());

    host.send(&command(70, "addSerializer", |p| {
        p.add_string("ext").add_string("Date").add_string("/s.py");
    }))
    .await;
    host.send(&command(71, "addDeserializer", |p| {
        p.add_string("ext").add_string("/d.py");
    }))
    .await;
    host.send(&command(72, "setCustomModulePaths", |p| {
        p.add_string("/opt/modules");
    }))
    .await;
    host.send(&command(73, "hasAutoComplete", |_| {})).await;

    let replies = host.recv_sorted(4).await;
    assert!(replies[..3].iter().all(|r| r.command() == commands::SUCCESS));
    assert_eq!(PayloadReader::new(replies[3].payload_bytes()).read_integer().unwrap(), 1);

    assert_eq!(kernel.serializer("ext").unwrap().path, "/s.py");
    assert_eq!(kernel.deserializer("ext").as_deref(), Some("/d.py"));
    assert_eq!(kernel.module_paths(), vec!["/opt/modules"]);
}

#[tokio::test]
async fn test_sql_commands() {
    let (mut host, _worker) = start_default(Arc::new(MemoryKernel::new()));

    let settings = Table::with_columns(&["query"])
        .with_row(vec![Cell::from("SELECT * FROM sales")])
        .unwrap();
    let bytes = TableCodec::encode(&settings).unwrap();
    host.send(&command(80, "putSql", |p| {
        p.add_string("db").add_bytes(&bytes);
    }))
    .await;
    assert_eq!(host.recv().await.command(), commands::SUCCESS);

    host.send(&command(81, "getSql", |p| {
        p.add_string("db");
    }))
    .await;
    let reply = host.recv().await;
    assert_eq!(reply.command(), "getSql_response");
    assert_eq!(read_string(&reply), "SELECT * FROM sales");
}

#[tokio::test]
async fn test_auto_complete_command() {
    let kernel = Arc::new(MemoryKernel::new());
    kernel
        .put_variable("input_table", Value::Table(numbers_table(1)))
        .unwrap();
    let (mut host, _worker) = start_default(kernel);

    host.send(&command(90, "autoComplete", |p| {
        p.add_string("x = inp").add_integer(1).add_integer(7);
    }))
    .await;

    let suggestions = read_table(&host.recv().await);
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions.rows()[0][0], Cell::from("input_table"));
    assert_eq!(suggestions.rows()[0][1], Cell::from("table"));
}
