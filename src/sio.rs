//! SIO command framing on the wire.
//!
//! One call to [`poll`] serves at most one command frame and always returns
//! to idle:
//!
//! ```text
//! Idle -> ReceivingFrame -> ChecksumCheck -> Dispatching -> Replying -> Idle
//! ```
//!
//! ## Frame
//!
//! | Word | Tag | Data            |
//! |------|-----|-----------------|
//! | 1    | $01 | device selector |
//! | 2    | $02 | command code    |
//! | 3    | $03 | aux1            |
//! | 4    | $04 | aux2            |
//! | 5    | $05 | checksum        |
//!
//! The FPGA queues one more untagged word when the command line is released;
//! it is read and discarded.
//!
//! ## Reply
//!
//! ```text
//! ACK  (ACK delay after the frame)
//! C/E  (completion delay after the handler ran)
//! data (150 us after C/E), then the payload checksum
//! ```
//!
//! Writes receive a data phase between ACK and C/E; see [`WRITE_COMMIT_DELAY_US`].

use crate::command::{checksum, reply, SioAction, SioCommand};
use crate::dispatch::{resolve, Handler, HandlerContext};
use crate::drive::{ImageKind, BLOCK_SIZE};
use crate::transport::Transport;
use tracing::{debug, trace, warn};

/// Delay before ACK; some DOSes need at least 50 us.
pub const ACK_DELAY_US: u64 = 100;
/// ACK delay before a flux-level read, matching a real drive's command decode.
pub const FLUX_ACK_DELAY_US: u64 = 3220;
/// Delay between ACK and COMPLETE/ERROR.
pub const COMPLETE_DELAY_US: u64 = 600;
/// Delay between COMPLETE/ERROR and the first data byte.
pub const DATA_DELAY_US: u64 = 150;
/// Delay between the write data ACK and committing the sector.
pub const WRITE_COMMIT_DELAY_US: u64 = 850;

const FRAME_WORDS: usize = 5;

/// What one poll did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SioOutcome {
    /// Nothing was waiting on the line.
    Idle,
    /// A word arrived out of sequence or with the error latch set.
    Dropped,
    /// Frame checksum mismatch, answered with NAK.
    BadChecksum,
    /// Addressed to a device or unit this drive does not serve.
    NotForUs,
    /// No handler for the command on this unit, answered with ERROR.
    Refused,
    /// Write data checksum mismatch, answered with NAK after the ACK.
    BadData,
    Served { handler: Handler, success: bool },
}

/// Receives one tagged frame. `None` when the tag sequence is broken.
fn receive_frame<T: Transport>(transport: &mut T) -> Option<SioCommand> {
    let mut frame = [0u8; FRAME_WORDS];
    for (i, byte) in frame.iter_mut().enumerate() {
        let word = transport.receive();
        if transport.error() || usize::from(word >> 8) != i + 1 {
            warn!(position = i + 1, word = format_args!("{word:#06x}"), "frame dropped");
            return None;
        }
        *byte = word as u8;
    }
    // Command line release marker.
    transport.receive();
    Some(SioCommand::from_frame(frame))
}

/// Serves one command frame if one is waiting.
pub fn poll<T: Transport>(transport: &mut T, ctx: &mut HandlerContext<'_, '_>) -> SioOutcome {
    if !transport.available() {
        return SioOutcome::Idle;
    }

    let Some(command) = receive_frame(transport) else {
        return SioOutcome::Dropped;
    };
    trace!(?command, "frame");

    if !command.checksum_valid() {
        warn!(?command, "frame checksum mismatch");
        transport.send(reply::NAK);
        return SioOutcome::BadChecksum;
    }
    transport.switch_rate();

    let device = command.device;
    let Some(unit) = device.unit_index().filter(|_| device.is_wire_drive()) else {
        return SioOutcome::NotForUs;
    };
    let Some(drive) = ctx
        .registry
        .unit(unit)
        .filter(|d| usize::from(d.sector_size()) != BLOCK_SIZE)
    else {
        return SioOutcome::NotForUs;
    };
    if !ctx.registry.has_own_image(unit) {
        return SioOutcome::NotForUs;
    }

    let flux = drive.kind() == ImageKind::FluxLevel;
    let transfer = drive.transfer_size(command.sector());
    let handler = resolve(&command, 0, drive);

    transport.set_led(true);
    let outcome = match handler {
        Some(handler) => {
            let flux_read = flux && handler == Handler::Read;
            ctx.clock.wait_us(if flux_read { FLUX_ACK_DELAY_US } else { ACK_DELAY_US });
            serve(transport, ctx, handler, &command, unit, transfer, flux_read)
        }
        None => {
            debug!(?command, unit, "no handler");
            ctx.clock.wait_us(ACK_DELAY_US);
            transport.send(reply::ERROR);
            SioOutcome::Refused
        }
    };
    transport.set_led(false);
    outcome
}

fn serve<T: Transport>(
    transport: &mut T,
    ctx: &mut HandlerContext<'_, '_>,
    handler: Handler,
    command: &SioCommand,
    unit: usize,
    transfer: usize,
    flux_read: bool,
) -> SioOutcome {
    transport.send(reply::ACK);
    let mut action = SioAction::new();

    if handler == Handler::Write {
        for byte in &mut action.buffer[..transfer] {
            *byte = transport.receive() as u8;
        }
        let expected = transport.receive() as u8;
        if checksum(&action.buffer[..transfer]) != expected {
            warn!(unit, sector = command.sector(), "write data checksum mismatch");
            transport.send(reply::NAK);
            return SioOutcome::BadData;
        }
        transport.send(reply::ACK);
        ctx.clock.wait_us(WRITE_COMMIT_DELAY_US);
        ctx.execute(handler, command, unit, &mut action);
        ctx.clock.wait_us(COMPLETE_DELAY_US);
        transport.send(completion(action.success));
        return SioOutcome::Served {
            handler,
            success: action.success,
        };
    }

    ctx.execute(handler, command, unit, &mut action);

    if action.respond {
        // The flux engine already waited out the drive's own timing.
        if !flux_read {
            ctx.clock.wait_us(COMPLETE_DELAY_US);
        }
        transport.send(completion(action.success));
        ctx.clock.wait_us(DATA_DELAY_US);
        let payload = action.payload();
        transport.send_all(payload);
        transport.send(checksum(payload));
    }
    if let Some(divisor) = action.divisor {
        debug!(divisor, "divisor change");
        transport.set_divisor(divisor);
    }

    SioOutcome::Served {
        handler,
        success: action.success,
    }
}

const fn completion(success: bool) -> u8 {
    if success {
        reply::COMPLETE
    } else {
        reply::ERROR
    }
}
