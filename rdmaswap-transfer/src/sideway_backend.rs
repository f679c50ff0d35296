use std::{io, mem::MaybeUninit, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rdma_mummy_sys::{ibv_port_attr, ibv_query_port};
use sideway::ibverbs::{
    address::{AddressHandleAttribute, Gid},
    completion::{GenericCompletionQueue, PollCompletionQueueError},
    device::{DeviceInfo, DeviceList},
    device_context::{DeviceContext, Mtu, PortState},
    memory_region::MemoryRegion,
    protection_domain::ProtectionDomain,
    queue_pair::{
        GenericQueuePair, PostSendGuard, QueuePair, QueuePairAttribute, QueuePairState,
        QueuePairType, SetScatterGatherEntry, WorkRequestFlags,
    },
    AccessFlags,
};
use tracing::{debug, info, warn};

use crate::{
    api::{RemoteSlot, TransportConfig, PAGE_SIZE},
    backend::RdmaBackend,
    completion::{poll_completion, TransferOp, WorkCompletion},
    error::{Result, TransferError},
    peer_address::PeerAddress,
};

struct PortInfo {
    port_num: u8,
    gid_index: u8,
    mtu: Mtu,
    gid: Gid,
    lid: u16,
}

/// Verbs objects owned by an initialized transport.
///
/// Field order is drop order: QP, CQ, MR, staging buffer, PD, device.
struct VerbsContext {
    qp: GenericQueuePair,
    cq: GenericCompletionQueue,
    staging_mr: Arc<MemoryRegion>,
    staging: Box<[u8; PAGE_SIZE]>,
    _pd: Arc<ProtectionDomain>,
    _device_ctx: Arc<DeviceContext>,
    local: PeerAddress,
    next_wr_id: u64,
}

// The raw verbs handles are only touched with the context mutex held.
unsafe impl Send for VerbsContext {}

/// One-sided page transport over libibverbs.
#[derive(Default)]
pub struct SidewayBackend {
    context: Mutex<Option<VerbsContext>>,
}

impl SidewayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our half of the RC connection, to hand to the peer out of band.
    pub fn local_endpoint(&self) -> Option<PeerAddress> {
        self.context.lock().as_ref().map(|ctx| ctx.local.clone())
    }

    fn choose_port_and_gid(device_ctx: &Arc<DeviceContext>) -> Result<PortInfo> {
        let dev_attr = device_ctx
            .query_device()
            .map_err(|error| TransferError::Backend(error.to_string()))?;
        let gid_entries = device_ctx
            .query_gid_table()
            .map_err(|error| TransferError::Backend(error.to_string()))?;

        for port_num in 1..=dev_attr.phys_port_cnt() {
            let port_attr = device_ctx
                .query_port(port_num)
                .map_err(|error| TransferError::Backend(error.to_string()))?;
            if port_attr.port_state() != PortState::Active {
                continue;
            }

            let mut picked: Option<(u8, Gid)> = None;
            for entry in gid_entries
                .iter()
                .filter(|entry| entry.port_num() == port_num as u32)
            {
                let gid = entry.gid();
                if gid.is_zero() {
                    continue;
                }
                if !gid.is_unicast_link_local() {
                    picked = Some((entry.gid_index() as u8, gid));
                    break;
                }
                if picked.is_none() {
                    picked = Some((entry.gid_index() as u8, gid));
                }
            }

            let (gid_index, gid) = match picked {
                Some(picked) => picked,
                None => {
                    let gid = device_ctx
                        .query_gid(port_num, 0)
                        .map_err(|error| TransferError::Backend(error.to_string()))?;
                    (0, gid)
                }
            };

            let mut raw_port = unsafe { MaybeUninit::<ibv_port_attr>::zeroed().assume_init() };
            let query_port_ret = unsafe {
                ibv_query_port(device_ctx.context().as_ptr(), port_num, &raw mut raw_port)
            };
            if query_port_ret != 0 {
                return Err(TransferError::Backend(format!(
                    "query raw port attr failed: {}",
                    io::Error::from_raw_os_error(query_port_ret)
                )));
            }

            return Ok(PortInfo {
                port_num,
                gid_index,
                mtu: port_attr.active_mtu(),
                gid,
                lid: raw_port.lid,
            });
        }

        Err(TransferError::Backend(
            "no active port found on selected NIC".to_string(),
        ))
    }

    fn open_device(nic_name: Option<&str>) -> Result<Arc<DeviceContext>> {
        let device_list =
            DeviceList::new().map_err(|error| TransferError::Backend(error.to_string()))?;
        let device = match nic_name {
            Some(name) => device_list.iter().find(|device| device.name() == name),
            None => device_list.iter().next(),
        }
        .ok_or_else(|| TransferError::DeviceNotFound(nic_name.unwrap_or("any").to_string()))?;

        device
            .open()
            .map_err(|error| TransferError::Backend(error.to_string()))
    }

    fn connect_rc_qp(
        qp: &mut GenericQueuePair,
        port: &PortInfo,
        local_psn: u32,
        peer: &PeerAddress,
    ) -> Result<()> {
        let mut init_attr = QueuePairAttribute::new();
        init_attr
            .setup_state(QueuePairState::Init)
            .setup_pkey_index(0)
            .setup_port(port.port_num)
            .setup_access_flags(
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
            );
        qp.modify(&init_attr)
            .map_err(|error| TransferError::Backend(error.to_string()))?;

        let mut ah_attr = AddressHandleAttribute::new();
        ah_attr
            .setup_dest_lid(peer.lid())
            .setup_port(port.port_num)
            .setup_grh_dest_gid(&Gid { raw: peer.gid() })
            .setup_grh_src_gid_index(port.gid_index)
            .setup_grh_hop_limit(64);

        let mut rtr_attr = QueuePairAttribute::new();
        rtr_attr
            .setup_state(QueuePairState::ReadyToReceive)
            .setup_path_mtu(port.mtu)
            .setup_dest_qp_num(peer.qp_num())
            .setup_rq_psn(peer.psn())
            .setup_max_dest_read_atomic(1)
            .setup_min_rnr_timer(12)
            .setup_address_vector(&ah_attr);
        qp.modify(&rtr_attr)
            .map_err(|error| TransferError::Backend(error.to_string()))?;

        let mut rts_attr = QueuePairAttribute::new();
        rts_attr
            .setup_state(QueuePairState::ReadyToSend)
            .setup_sq_psn(local_psn)
            .setup_timeout(14)
            .setup_retry_cnt(7)
            .setup_rnr_retry(7)
            .setup_max_read_atomic(1);
        qp.modify(&rts_attr)
            .map_err(|error| TransferError::Backend(error.to_string()))?;
        Ok(())
    }

    /// Builds every verbs object. Anything created before a failure is
    /// released by drop on the error path.
    fn create_context(config: &TransportConfig) -> Result<VerbsContext> {
        let peer = config.peer.as_ref().ok_or(TransferError::InvalidArgument(
            "peer endpoint is required for the verbs backend",
        ))?;

        let device_ctx = Self::open_device(config.nic_name.as_deref())?;
        let pd = device_ctx
            .alloc_pd()
            .map_err(|error| TransferError::Backend(error.to_string()))?;
        let port = Self::choose_port_and_gid(&device_ctx)?;

        let mut cq_builder = device_ctx.create_cq_builder();
        cq_builder.setup_cqe(config.cq_depth);
        let cq: GenericCompletionQueue = cq_builder
            .build()
            .map_err(|error| TransferError::Backend(error.to_string()))?
            .into();

        let mut qp_builder = pd.create_qp_builder();
        qp_builder
            .setup_qp_type(QueuePairType::ReliableConnection)
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq.clone())
            .setup_max_send_wr(config.cq_depth)
            .setup_max_recv_wr(1)
            .setup_max_send_sge(1)
            .setup_max_recv_sge(1);
        let mut qp: GenericQueuePair = qp_builder
            .build()
            .map_err(|error| TransferError::Backend(error.to_string()))?
            .into();

        let local_psn = qp.qp_number() & 0x00ff_ffff;
        Self::connect_rc_qp(&mut qp, &port, local_psn, peer)?;

        let staging = Box::new([0_u8; PAGE_SIZE]);
        let staging_mr = unsafe {
            pd.reg_mr(
                staging.as_ptr() as usize,
                PAGE_SIZE,
                AccessFlags::LocalWrite,
            )
        }
        .map_err(|error| TransferError::Backend(error.to_string()))?;

        let local = PeerAddress::from_parts(port.gid.raw, port.lid, qp.qp_number(), local_psn);
        Ok(VerbsContext {
            qp,
            cq,
            staging_mr,
            staging,
            _pd: pd,
            _device_ctx: device_ctx,
            local,
            next_wr_id: 1,
        })
    }

    fn post_and_wait(
        ctx: &mut VerbsContext,
        op: TransferOp,
        remote: RemoteSlot,
        timeout: Duration,
    ) -> Result<()> {
        let wr_id = ctx.next_wr_id;
        ctx.next_wr_id = ctx.next_wr_id.wrapping_add(1);
        let local_ptr = ctx.staging.as_ptr() as u64;
        let lkey = ctx.staging_mr.lkey();
        {
            let mut guard = ctx.qp.start_post_send();
            match op {
                TransferOp::Read => {
                    let wr = guard
                        .construct_wr(wr_id, WorkRequestFlags::Signaled)
                        .setup_read(remote.rkey, remote.addr);
                    unsafe {
                        wr.setup_sge(lkey, local_ptr, PAGE_SIZE as u32);
                    }
                }
                TransferOp::Write => {
                    let wr = guard
                        .construct_wr(wr_id, WorkRequestFlags::Signaled)
                        .setup_write(remote.rkey, remote.addr);
                    unsafe {
                        wr.setup_sge(lkey, local_ptr, PAGE_SIZE as u32);
                    }
                }
            }
            guard
                .post()
                .map_err(|error| TransferError::Backend(error.to_string()))?;
        }

        let cq = &ctx.cq;
        let outcome = poll_completion(wr_id, timeout, || match cq.start_poll() {
            Ok(mut poller) => {
                if let Some(wc) = (&mut poller).into_iter().next() {
                    return Ok(Some(WorkCompletion {
                        wr_id: wc.wr_id(),
                        status: wc.status(),
                        vendor_err: wc.vendor_err(),
                    }));
                }
                Ok(None)
            }
            Err(PollCompletionQueueError::CompletionQueueEmpty) => Ok(None),
            Err(error) => Err(TransferError::Backend(format!("poll CQ failed: {error}"))),
        })?;
        if !outcome.is_success() {
            warn!(wr_id, ?op, ?outcome, addr = remote.addr, "work request failed");
        }
        outcome.into_result(op, timeout)
    }
}

impl RdmaBackend for SidewayBackend {
    fn initialize(&self, config: TransportConfig) -> Result<()> {
        if config.cq_depth == 0 {
            return Err(TransferError::InvalidArgument("cq_depth must be non-zero"));
        }
        if matches!(config.nic_name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(TransferError::InvalidArgument("nic_name is empty"));
        }

        let mut guard = self.context.lock();
        if guard.is_some() {
            return Err(TransferError::AlreadyInitialized);
        }
        let ctx = Self::create_context(&config)?;
        info!(
            nic = config.nic_name.as_deref().unwrap_or("first"),
            cq_depth = config.cq_depth,
            local = %ctx.local,
            "verbs transport initialized"
        );
        *guard = Some(ctx);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.context.lock().is_some()
    }

    fn read_page(
        &self,
        dst: &mut [u8; PAGE_SIZE],
        remote: RemoteSlot,
        timeout: Duration,
    ) -> Result<()> {
        let mut guard = self.context.lock();
        let ctx = guard.as_mut().ok_or(TransferError::NotInitialized)?;
        Self::post_and_wait(ctx, TransferOp::Read, remote, timeout)?;
        dst.copy_from_slice(&ctx.staging[..]);
        Ok(())
    }

    fn write_page(&self, src: &[u8; PAGE_SIZE], remote: RemoteSlot, timeout: Duration) -> Result<()> {
        let mut guard = self.context.lock();
        let ctx = guard.as_mut().ok_or(TransferError::NotInitialized)?;
        ctx.staging.copy_from_slice(&src[..]);
        Self::post_and_wait(ctx, TransferOp::Write, remote, timeout)
    }

    fn cleanup(&self) {
        if let Some(ctx) = self.context.lock().take() {
            debug!(local = %ctx.local, "destroying verbs transport");
            drop(ctx);
            info!("verbs transport destroyed");
        }
    }
}
