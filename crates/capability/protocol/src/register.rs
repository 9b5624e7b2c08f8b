//! 寄存器服务器（Modbus TCP 子集）
//!
//! 地址空间：每 agent 100 槽（0-499）+ 系统状态块（500-599）。
//! 支持 FC03 读保持寄存器、FC06 写单寄存器；其余功能码回
//! IllegalFunction 异常。读取现算自最新值缓存（无影子寄存器组，
//! 两种表示之间不会漂移）；写入只允许映射表标记可写的地址，
//! 先做缩放/枚举的逆变换，逆变换不成立在协议边界直接拒绝。
//! 可选客户端来源白名单在 accept 时生效，命中拒绝直接断开。

use crate::error::ProtocolError;
use crate::status::system_status;
use bridge_control::WriteBackRouter;
use bridge_mapping::MappingTable;
use bridge_store::ValueStore;
use bridge_telemetry::{
    record_register_read, record_register_write, record_stale_read,
    record_write_request_accepted, record_write_request_rejected,
};
use domain::{WriteOrigin, WriteRequest};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// 地址空间上界（不含）。
const ADDRESS_SPACE_END: u16 = 600;
/// 单次读取的最大寄存器数。
const MAX_READ_QUANTITY: u16 = 125;

/// Modbus 功能码
const FC_READ_HOLDING: u8 = 0x03;
const FC_WRITE_SINGLE: u8 = 0x06;

/// Modbus 异常码
const EXC_ILLEGAL_FUNCTION: u8 = 0x01;
const EXC_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const EXC_ILLEGAL_DATA_VALUE: u8 = 0x03;
const EXC_SERVER_FAILURE: u8 = 0x04;

struct ServerContext {
    store: Arc<ValueStore>,
    mapping: Arc<MappingTable>,
    router: WriteBackRouter,
}

/// 寄存器服务器。
pub struct RegisterServer {
    ctx: Arc<ServerContext>,
    allowlist: Vec<IpAddr>,
}

impl RegisterServer {
    pub fn new(
        store: Arc<ValueStore>,
        mapping: Arc<MappingTable>,
        router: WriteBackRouter,
        allowlist: Vec<IpAddr>,
    ) -> Self {
        Self {
            ctx: Arc::new(ServerContext {
                store,
                mapping,
                router,
            }),
            allowlist,
        }
    }

    /// 绑定端口并运行（绑定失败对本监听器致命）。
    pub async fn run(&self, addr: SocketAddr) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ProtocolError::Bind(err.to_string()))?;
        info!(target: "bridge.protocol", %addr, "register_server_listening");
        self.serve(listener).await
    }

    /// 在已绑定的监听器上服务。
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProtocolError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            if !self.peer_allowed(peer.ip()) {
                warn!(
                    target: "bridge.protocol",
                    peer = %peer,
                    "register_client_rejected_by_allowlist"
                );
                drop(stream);
                continue;
            }
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(ctx, stream).await {
                    warn!(target: "bridge.protocol", peer = %peer, error = %err, "register_session_error");
                }
            });
        }
    }

    /// 白名单为空 = 放行所有来源。
    fn peer_allowed(&self, peer: IpAddr) -> bool {
        self.allowlist.is_empty() || self.allowlist.contains(&peer)
    }
}

/// 单连接循环：MBAP 帧收发。
async fn handle_connection(ctx: Arc<ServerContext>, mut stream: TcpStream) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 7];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err),
        }

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit_id = header[6];
        if protocol_id != 0 || length < 2 || length > 260 {
            // 非 Modbus 帧，直接断开
            break;
        }

        let mut pdu = vec![0u8; length - 1];
        stream.read_exact(&mut pdu).await?;

        let response_pdu = process_pdu(&ctx, &pdu).await;

        let mut frame = Vec::with_capacity(7 + response_pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(&response_pdu);
        stream.write_all(&frame).await?;
    }
    Ok(())
}

async fn process_pdu(ctx: &ServerContext, pdu: &[u8]) -> Vec<u8> {
    let Some(&function_code) = pdu.first() else {
        return exception(0, EXC_ILLEGAL_FUNCTION);
    };
    match function_code {
        FC_READ_HOLDING => read_holding(ctx, &pdu[1..]),
        FC_WRITE_SINGLE => write_single(ctx, &pdu[1..]).await,
        _ => exception(function_code, EXC_ILLEGAL_FUNCTION),
    }
}

fn read_holding(ctx: &ServerContext, data: &[u8]) -> Vec<u8> {
    if data.len() != 4 {
        return exception(FC_READ_HOLDING, EXC_ILLEGAL_DATA_VALUE);
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let quantity = u16::from_be_bytes([data[2], data[3]]);
    if quantity == 0 || quantity > MAX_READ_QUANTITY {
        return exception(FC_READ_HOLDING, EXC_ILLEGAL_DATA_VALUE);
    }
    let end = address as u32 + quantity as u32;
    if end > ADDRESS_SPACE_END as u32 {
        return exception(FC_READ_HOLDING, EXC_ILLEGAL_DATA_ADDRESS);
    }

    record_register_read();
    let mut response = Vec::with_capacity(2 + quantity as usize * 2);
    response.push(FC_READ_HOLDING);
    response.push((quantity * 2) as u8);
    for offset in 0..quantity {
        let value = register_value(ctx, address + offset);
        response.extend_from_slice(&(value as u16).to_be_bytes());
    }
    response
}

async fn write_single(ctx: &ServerContext, data: &[u8]) -> Vec<u8> {
    if data.len() != 4 {
        return exception(FC_WRITE_SINGLE, EXC_ILLEGAL_DATA_VALUE);
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let raw = u16::from_be_bytes([data[2], data[3]]) as i16;

    let Some(entry) = ctx.mapping.by_register(address) else {
        record_write_request_rejected();
        return exception(FC_WRITE_SINGLE, EXC_ILLEGAL_DATA_ADDRESS);
    };
    if !entry.writable {
        record_write_request_rejected();
        return exception(FC_WRITE_SINGLE, EXC_ILLEGAL_DATA_ADDRESS);
    }

    // 缩放/枚举逆变换恢复原始值；逆变换不成立即拒绝
    let proposed = match entry.encoding.decode_register(raw) {
        Ok(value) => value,
        Err(err) => {
            record_write_request_rejected();
            warn!(
                target: "bridge.protocol",
                register = address,
                raw = raw,
                error = %err,
                "register_write_not_invertible"
            );
            return exception(FC_WRITE_SINGLE, EXC_ILLEGAL_DATA_VALUE);
        }
    };
    if let Err(err) = entry.validate_write(&proposed) {
        record_write_request_rejected();
        warn!(
            target: "bridge.protocol",
            register = address,
            error = %err,
            "register_write_rejected"
        );
        return exception(FC_WRITE_SINGLE, EXC_ILLEGAL_DATA_VALUE);
    }

    let request = WriteRequest {
        key: entry.key(),
        value: proposed,
        origin: WriteOrigin::RegisterFile,
    };
    match ctx.router.submit(request).await {
        Ok(()) => {
            record_write_request_accepted();
            record_register_write();
            let mut response = Vec::with_capacity(5);
            response.push(FC_WRITE_SINGLE);
            response.extend_from_slice(data);
            response
        }
        Err(err) => {
            warn!(
                target: "bridge.protocol",
                register = address,
                error = %err,
                "register_write_publish_failed"
            );
            exception(FC_WRITE_SINGLE, EXC_SERVER_FAILURE)
        }
    }
}

/// 单个寄存器的当前值：映射槽现算、系统块派生、空槽为 0。
fn register_value(ctx: &ServerContext, address: u16) -> i16 {
    if let Some(entry) = ctx.mapping.by_register(address) {
        let value = match ctx.store.read(&entry.key()) {
            Some(reading) => {
                if reading.stale {
                    record_stale_read();
                }
                reading.value
            }
            None => entry.default.clone(),
        };
        return entry.encoding.encode_register(&value);
    }

    match address {
        500 => {
            let status = system_status(&ctx.store, &ctx.mapping);
            status.overall_health.trunc() as i16
        }
        501 => system_status(&ctx.store, &ctx.mapping).active_agents as i16,
        502 => system_status(&ctx.store, &ctx.mapping).total_alerts as i16,
        503 => system_status(&ctx.store, &ctx.mapping).state as i16,
        _ => 0,
    }
}

fn exception(function_code: u8, code: u8) -> Vec<u8> {
    vec![function_code | 0x80, code]
}
