// Randomness requests for raffle draws
use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};
use solana_program::{
    clock::{Slot, UnixTimestamp},
    hash::{hash, hashv},
    instruction::Instruction,
    msg,
    program_error::ProgramError,
    program_pack::{IsInitialized, Pack, Sealed},
    pubkey::Pubkey,
};

use crate::error::SettlementError;

/// Ed25519 signature verification precompile
pub const ED25519_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("Ed25519SigVerify111111111111111111111111111");

pub const SIGNATURE_LEN: usize = 64;
const PUBKEY_LEN: usize = 32;
const SIGNATURE_OFFSETS_START: usize = 2;
const SIGNATURE_OFFSETS_LEN: usize = 14;
const PROOF_DATA_START: usize = SIGNATURE_OFFSETS_START + SIGNATURE_OFFSETS_LEN;

/// Instruction index meaning "the verify instruction itself"
const CURRENT_INSTRUCTION: u16 = u16::MAX;

/// A randomness request issued for one raffle draw. The off-chain authority
/// watches pending requests and answers each with an Ed25519 signature over
/// `seed`, verified by the precompile in the same transaction as
/// `FulfillRandomness`. Ed25519 signatures are deterministic, so the
/// authority can delay an answer but cannot pick among outcomes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomnessRequest {
    pub is_initialized: bool,
    pub bump: u8,
    pub request_id: u64,
    /// Raffle the randomness is for
    pub raffle: Pubkey,
    /// Wallet that paid for the request account
    pub requester: Pubkey,
    pub requested_at: UnixTimestamp,
    /// Message the authority must sign
    pub seed: [u8; 32],
    /// Cleared once the randomness has been consumed
    pub pending: bool,
    pub fulfilled_at: UnixTimestamp,
    pub randomness: [u8; 32],
}

impl RandomnessRequest {
    pub fn new(
        request_id: u64,
        bump: u8,
        raffle: Pubkey,
        requester: Pubkey,
        requested_at: UnixTimestamp,
        slot: Slot,
    ) -> Self {
        Self {
            is_initialized: true,
            bump,
            request_id,
            raffle,
            requester,
            requested_at,
            seed: request_seed(&raffle, request_id, &requester, slot),
            pending: true,
            fulfilled_at: 0,
            randomness: [0u8; 32],
        }
    }

    /// Check that `proof` is the authority's signature over this request's
    /// seed and that `randomness` is the value it commits to
    pub fn check_proof(
        &self,
        proof: &SignedSeed,
        authority: &Pubkey,
        randomness: &[u8; 32],
    ) -> Result<(), SettlementError> {
        if proof.signer != *authority {
            msg!("Randomness signed by {}, expected {}", proof.signer, authority);
            return Err(SettlementError::InvalidRandomnessProof);
        }
        if proof.message != self.seed {
            msg!("Signed message is not the seed of request {}", self.request_id);
            return Err(SettlementError::InvalidRandomnessProof);
        }
        if randomness_from_signature(&proof.signature) != *randomness {
            msg!("Randomness does not match the signed seed");
            return Err(SettlementError::InvalidRandomnessProof);
        }
        Ok(())
    }

    /// Accept the one fulfillment this request allows
    pub fn fulfill(
        &mut self,
        request_id: u64,
        raffle: &Pubkey,
        randomness: [u8; 32],
        now: UnixTimestamp,
    ) -> Result<(), SettlementError> {
        if !self.is_initialized || !self.pending || self.request_id != request_id {
            return Err(SettlementError::DuplicateCallback);
        }
        if self.raffle != *raffle {
            return Err(SettlementError::AccountMismatch);
        }
        self.pending = false;
        self.fulfilled_at = now;
        self.randomness = randomness;
        Ok(())
    }
}

impl Sealed for RandomnessRequest {}

impl IsInitialized for RandomnessRequest {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl Pack for RandomnessRequest {
    const LEN: usize = 1 + 1 + 8 + 32 + 32 + 8 + 32 + 1 + 8 + 32;

    fn unpack_from_slice(src: &[u8]) -> Result<Self, ProgramError> {
        let src = array_ref![src, 0, RandomnessRequest::LEN];
        let (
            is_initialized,
            bump,
            request_id,
            raffle,
            requester,
            requested_at,
            seed,
            pending,
            fulfilled_at,
            randomness,
        ) = array_refs![src, 1, 1, 8, 32, 32, 8, 32, 1, 8, 32];

        Ok(RandomnessRequest {
            is_initialized: is_initialized[0] != 0,
            bump: bump[0],
            request_id: u64::from_le_bytes(*request_id),
            raffle: Pubkey::new_from_array(*raffle),
            requester: Pubkey::new_from_array(*requester),
            requested_at: UnixTimestamp::from_le_bytes(*requested_at),
            seed: *seed,
            pending: pending[0] != 0,
            fulfilled_at: UnixTimestamp::from_le_bytes(*fulfilled_at),
            randomness: *randomness,
        })
    }

    fn pack_into_slice(&self, dst: &mut [u8]) {
        let dst = array_mut_ref![dst, 0, RandomnessRequest::LEN];
        let (
            is_initialized_dst,
            bump_dst,
            request_id_dst,
            raffle_dst,
            requester_dst,
            requested_at_dst,
            seed_dst,
            pending_dst,
            fulfilled_at_dst,
            randomness_dst,
        ) = mut_array_refs![dst, 1, 1, 8, 32, 32, 8, 32, 1, 8, 32];

        is_initialized_dst[0] = self.is_initialized as u8;
        bump_dst[0] = self.bump;
        *request_id_dst = self.request_id.to_le_bytes();
        raffle_dst.copy_from_slice(self.raffle.as_ref());
        requester_dst.copy_from_slice(self.requester.as_ref());
        *requested_at_dst = self.requested_at.to_le_bytes();
        seed_dst.copy_from_slice(&self.seed);
        pending_dst[0] = self.pending as u8;
        *fulfilled_at_dst = self.fulfilled_at.to_le_bytes();
        randomness_dst.copy_from_slice(&self.randomness);
    }
}

/// Message the randomness authority signs to answer a request
pub fn request_seed(raffle: &Pubkey, request_id: u64, requester: &Pubkey, slot: Slot) -> [u8; 32] {
    hashv(&[
        raffle.as_ref(),
        &request_id.to_le_bytes(),
        requester.as_ref(),
        &slot.to_le_bytes(),
    ])
    .to_bytes()
}

pub fn randomness_from_signature(signature: &[u8; SIGNATURE_LEN]) -> [u8; 32] {
    hash(signature).to_bytes()
}

/// One signature checked by an Ed25519 verify instruction, with the public
/// key, signature and message all stored inside that instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedSeed {
    pub signer: Pubkey,
    pub signature: [u8; SIGNATURE_LEN],
    pub message: Vec<u8>,
}

impl SignedSeed {
    pub fn from_instruction(ix: &Instruction) -> Result<Self, SettlementError> {
        if ix.program_id != ED25519_PROGRAM_ID {
            msg!("Expected an Ed25519 verify instruction, found {}", ix.program_id);
            return Err(SettlementError::InvalidRandomnessProof);
        }
        let data = &ix.data;
        if data.len() < PROOF_DATA_START || data[0] != 1 {
            msg!("Ed25519 instruction must carry exactly one signature");
            return Err(SettlementError::InvalidRandomnessProof);
        }

        let offsets = array_ref![data, SIGNATURE_OFFSETS_START, SIGNATURE_OFFSETS_LEN];
        let (
            signature_offset,
            signature_ix,
            pubkey_offset,
            pubkey_ix,
            message_offset,
            message_len,
            message_ix,
        ) = array_refs![offsets, 2, 2, 2, 2, 2, 2, 2];
        let read = |field: &[u8; 2]| u16::from_le_bytes(*field);

        // Data pulled from other instructions is not covered by this one
        if [signature_ix, pubkey_ix, message_ix]
            .iter()
            .any(|index| read(*index) != CURRENT_INSTRUCTION)
        {
            msg!("Ed25519 offsets must point into the verify instruction");
            return Err(SettlementError::InvalidRandomnessProof);
        }

        let field = |offset: u16, len: usize| {
            let start = offset as usize;
            data.get(start..start + len)
                .ok_or(SettlementError::InvalidRandomnessProof)
        };
        let signer = field(read(pubkey_offset), PUBKEY_LEN)?;
        let signature = field(read(signature_offset), SIGNATURE_LEN)?;
        let message = field(read(message_offset), read(message_len) as usize)?;

        let mut signed = SignedSeed {
            signer: Pubkey::new(signer),
            signature: [0u8; SIGNATURE_LEN],
            message: message.to_vec(),
        };
        signed.signature.copy_from_slice(signature);
        Ok(signed)
    }

    /// Ed25519 program instruction data verifying this signature
    pub fn to_instruction_data(&self) -> Vec<u8> {
        let pubkey_offset = PROOF_DATA_START;
        let signature_offset = pubkey_offset + PUBKEY_LEN;
        let message_offset = signature_offset + SIGNATURE_LEN;

        let mut data = Vec::with_capacity(message_offset + self.message.len());
        data.extend_from_slice(&[1, 0]);
        for field in [
            signature_offset as u16,
            CURRENT_INSTRUCTION,
            pubkey_offset as u16,
            CURRENT_INSTRUCTION,
            message_offset as u16,
            self.message.len() as u16,
            CURRENT_INSTRUCTION,
        ] {
            data.extend_from_slice(&field.to_le_bytes());
        }
        data.extend_from_slice(self.signer.as_ref());
        data.extend_from_slice(&self.signature);
        data.extend_from_slice(&self.message);
        data
    }
}

/// First 8 bytes of the randomness as a little-endian u64
pub fn random_u64(randomness: &[u8; 32]) -> u64 {
    u64::from_le_bytes(*array_ref![randomness, 0, 8])
}

/// Ticket index drawn from the randomness, in `0..ticket_count`
pub fn winner_index(randomness: &[u8; 32], ticket_count: u64) -> u64 {
    if ticket_count == 0 {
        return 0;
    }
    random_u64(randomness) % ticket_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winner_index_uses_low_eight_bytes() {
        let mut randomness = [0xffu8; 32];
        randomness[..8].copy_from_slice(&17u64.to_le_bytes());
        assert_eq!(random_u64(&randomness), 17);
        assert_eq!(winner_index(&randomness, 5), 2);
        assert_eq!(winner_index(&randomness, 0), 0);
    }

    fn signed(signer: Pubkey, message: &[u8]) -> SignedSeed {
        SignedSeed {
            signer,
            signature: [9u8; SIGNATURE_LEN],
            message: message.to_vec(),
        }
    }

    #[test]
    fn request_is_fulfilled_at_most_once() {
        let raffle = Pubkey::new_unique();
        let mut request = RandomnessRequest::new(1, 255, raffle, Pubkey::new_unique(), 100, 7);

        assert_eq!(
            request.fulfill(2, &raffle, [1u8; 32], 110),
            Err(SettlementError::DuplicateCallback)
        );
        assert_eq!(
            request.fulfill(1, &Pubkey::new_unique(), [1u8; 32], 110),
            Err(SettlementError::AccountMismatch)
        );

        request.fulfill(1, &raffle, [1u8; 32], 110).unwrap();
        assert!(!request.pending);
        assert_eq!(request.fulfilled_at, 110);

        let after_first = request;
        assert_eq!(
            request.fulfill(1, &raffle, [2u8; 32], 120),
            Err(SettlementError::DuplicateCallback)
        );
        assert_eq!(request, after_first);
    }

    #[test]
    fn pack_round_trip() {
        let raffle = Pubkey::new_unique();
        let mut request = RandomnessRequest::new(9, 254, raffle, Pubkey::new_unique(), 42, 300);
        request.fulfill(9, &raffle, [7u8; 32], 50).unwrap();
        let mut buf = [0u8; RandomnessRequest::LEN];
        RandomnessRequest::pack(request, &mut buf).unwrap();
        assert_eq!(RandomnessRequest::unpack(&buf).unwrap(), request);
    }

    #[test]
    fn seed_depends_on_request_and_slot() {
        let (raffle, requester) = (Pubkey::new_unique(), Pubkey::new_unique());
        let seed = request_seed(&raffle, 1, &requester, 10);
        assert_ne!(seed, request_seed(&raffle, 2, &requester, 10));
        assert_ne!(seed, request_seed(&raffle, 1, &requester, 11));
        assert_ne!(seed, request_seed(&Pubkey::new_unique(), 1, &requester, 10));

        let request = RandomnessRequest::new(1, 255, raffle, requester, 100, 10);
        assert_eq!(request.seed, seed);
    }

    #[test]
    fn proof_must_sign_seed_with_authority_key() {
        let authority = Pubkey::new_unique();
        let request = RandomnessRequest::new(3, 255, Pubkey::new_unique(), Pubkey::new_unique(), 100, 10);
        let proof = signed(authority, &request.seed);
        let randomness = randomness_from_signature(&proof.signature);

        request.check_proof(&proof, &authority, &randomness).unwrap();

        let forged = signed(Pubkey::new_unique(), &request.seed);
        assert_eq!(
            request.check_proof(&forged, &authority, &randomness),
            Err(SettlementError::InvalidRandomnessProof)
        );
        let other_message = signed(authority, &[1u8; 32]);
        assert_eq!(
            request.check_proof(&other_message, &authority, &randomness),
            Err(SettlementError::InvalidRandomnessProof)
        );
        // The caller cannot substitute its own value for the signed one
        assert_eq!(
            request.check_proof(&proof, &authority, &[0u8; 32]),
            Err(SettlementError::InvalidRandomnessProof)
        );
    }

    #[test]
    fn reads_ed25519_instruction() {
        let proof = signed(Pubkey::new_unique(), &[5u8; 32]);
        let ix = Instruction {
            program_id: ED25519_PROGRAM_ID,
            accounts: vec![],
            data: proof.to_instruction_data(),
        };
        assert_eq!(ix.data.len(), PROOF_DATA_START + 32 + 64 + 32);
        assert_eq!(SignedSeed::from_instruction(&ix).unwrap(), proof);

        let mut other_program = ix.clone();
        other_program.program_id = Pubkey::new_unique();
        assert_eq!(
            SignedSeed::from_instruction(&other_program),
            Err(SettlementError::InvalidRandomnessProof)
        );

        // Message borrowed from instruction 0 instead of the verify instruction
        let mut borrowed = ix.clone();
        borrowed.data[14..16].copy_from_slice(&0u16.to_le_bytes());
        assert_eq!(
            SignedSeed::from_instruction(&borrowed),
            Err(SettlementError::InvalidRandomnessProof)
        );

        let mut truncated = ix;
        truncated.data.truncate(PROOF_DATA_START + 40);
        assert_eq!(
            SignedSeed::from_instruction(&truncated),
            Err(SettlementError::InvalidRandomnessProof)
        );
    }
}
