// Device role: this node is being provisioned.
//
// Invite -> Capabilities, Start, Public Key exchange, optional Input
// Complete, Confirm/Random exchange, then the encrypted provisioning data.

use tracing::{debug, warn};

use super::*;
use crate::addr;

#[derive(Debug, Default)]
pub struct Device;

impl Device {
    fn capabilities(ctx: &ProvCtx<'_>) -> [u8; 11] {
        let mut caps = [0u8; 11];
        caps[0] = ctx.elem_count;
        caps[1..3].copy_from_slice(&ALG_P256.to_be_bytes());
        // No OOB public key
        caps[3] = 0x00;
        caps[4] = ctx.app.static_oob().is_some() as u8;
        caps[5] = ctx.info.output_size;
        caps[6..8].copy_from_slice(&ctx.info.output_actions.to_be_bytes());
        caps[8] = ctx.info.input_size;
        caps[9..11].copy_from_slice(&ctx.info.input_actions.to_be_bytes());
        caps
    }
}

impl ProvRole for Device {
    fn is_provisioner(&self) -> bool {
        false
    }

    fn handles(&self, pdu_type: u8) -> bool {
        matches!(
            pdu_type,
            PROV_INVITE | PROV_START | PROV_PUB_KEY | PROV_CONFIRM | PROV_RANDOM | PROV_DATA
        )
    }

    fn link_opened(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        ctx.link.expect = Some(PROV_INVITE);
        Ok(())
    }

    fn error(&mut self, ctx: &mut ProvCtx<'_>, reason: u8) {
        debug!("Sending Failed with reason 0x{:02x}", reason);
        ctx.send(PROV_FAILED, &[reason]);
        // Wait for the provisioner to close the link
        ctx.link.expect = None;
    }

    fn input_complete(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        // Before the key exchange, Input Complete follows our public key
        if ctx.link.dhkey.is_some() {
            ctx.send(PROV_INPUT_COMPLETE, &[]);
            ctx.link.expect = Some(PROV_CONFIRM);
        }
        Ok(())
    }

    fn on_invite(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        debug!("Attention Duration: {} seconds", data[0]);
        if data[0] != 0 {
            ctx.app.attention(data[0]);
        }
        ctx.link.conf_inputs.invite.copy_from_slice(data);

        let caps = Self::capabilities(ctx);
        ctx.link.conf_inputs.capabilities = caps;
        ctx.send(PROV_CAPABILITIES, &caps);
        ctx.link.expect = Some(PROV_START);
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        debug!(
            "Algorithm 0x{:02x} PubKey 0x{:02x} Method 0x{:02x} Action 0x{:02x} Size 0x{:02x}",
            data[0], data[1], data[2], data[3], data[4]
        );

        if data[0] != 0x00 {
            warn!("Unknown algorithm 0x{:02x}", data[0]);
            return Err(ProvError::InvalidFormat("algorithm"));
        }
        if data[1] != 0x00 {
            warn!("Public key type 0x{:02x} not supported", data[1]);
            return Err(ProvError::InvalidFormat("public key type"));
        }

        ctx.link.conf_inputs.start.copy_from_slice(data);

        if let Err(e) = ctx.auth(false, data[2], data[3], data[4]) {
            warn!(
                "Invalid authentication method 0x{:02x} action 0x{:02x} size {}: {}",
                data[2], data[3], data[4], e
            );
            return Err(ProvError::InvalidFormat("authentication"));
        }

        ctx.link.expect = Some(PROV_PUB_KEY);
        Ok(())
    }

    fn on_pub_key(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        ctx.link.conf_inputs.pub_key_prov.copy_from_slice(data);
        let local = ctx.local_public_key()?;
        ctx.dh(data)?;
        ctx.link.conf_inputs.pub_key_dev = local;
        ctx.send(PROV_PUB_KEY, &local);

        if ctx.waiting_for_input() {
            ctx.link.expect = None;
        } else {
            if ctx.link.oob_method == AUTH_INPUT {
                // Input finished before the key exchange
                ctx.send(PROV_INPUT_COMPLETE, &[]);
            }
            ctx.link.expect = Some(PROV_CONFIRM);
        }
        Ok(())
    }

    fn on_confirm(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        ctx.notify_input_complete();
        let conf = ctx.local_confirm()?;
        ctx.peer_confirm(data)?;
        ctx.send(PROV_CONFIRM, &conf);
        ctx.link.expect = Some(PROV_RANDOM);
        Ok(())
    }

    fn on_random(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        ctx.check_confirm(data)?;
        ctx.link.peer_rand.copy_from_slice(data);
        let rand = ctx.link.rand;
        ctx.send(PROV_RANDOM, &rand);
        ctx.link.expect = Some(PROV_DATA);
        Ok(())
    }

    fn on_data(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        let rand_prov = ctx.link.peer_rand;
        let rand_dev = ctx.link.rand;
        let keys = ctx.session_keys(&rand_prov, &rand_dev)?;

        let plain = ctx
            .crypto
            .ccm_decrypt(&keys.key, &keys.nonce, data)
            .map_err(|e| {
                warn!("Unable to decrypt provisioning data: {}", e);
                ProvError::Decrypt
            })?;

        let mut net_key = [0u8; 16];
        net_key.copy_from_slice(&plain[..16]);
        let net_idx = u16::from_be_bytes([plain[16], plain[17]]);
        let flags = plain[18];
        let iv_index = u32::from_be_bytes([plain[19], plain[20], plain[21], plain[22]]);
        let addr = u16::from_be_bytes([plain[23], plain[24]]);

        debug!(
            "net_idx {} iv_index 0x{:08x}, addr 0x{:04x}",
            net_idx, iv_index, addr
        );

        if !addr::is_unicast(addr) {
            warn!("Assigned address 0x{:04x} is not unicast", addr);
            return Err(ProvError::InvalidFormat("unicast address"));
        }

        ctx.send(PROV_COMPLETE, &[]);
        ctx.link.expect = None;
        ctx.actions.push(ProvAction::Provisioned(ProvData {
            net_key,
            net_idx,
            flags,
            iv_index,
            addr,
            dev_key: keys.dev_key,
        }));
        Ok(())
    }
}
