//! Binary record packing (§6, §9): fixed-size BIG_ENDIAN records for the
//! profit-tracking raw endpoints, plus msgpack encoding for the short-key
//! action/price records.

use anyhow::{bail, Result};

use crate::{
    profit_tracking::FlipRow,
    types::{Action, ActionWire, ItemPriceWire},
};

pub const FLIP_V2_SIZE: usize = 84;
pub const ACKED_TRANSACTION_SIZE: usize = 56;

/// Splits a 128-bit UUID into sign-preserving signed 64-bit halves: values
/// with the top bit set are shifted into negative range by subtracting 2^64,
/// matching the wire format's expectation of two `i64` limbs.
pub fn uuid_to_signed_halves(uuid: &uuid::Uuid) -> (i64, i64) {
    let bytes = uuid.as_bytes();
    let msb = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let lsb = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    (msb as i64, lsb as i64)
}

pub fn signed_halves_to_uuid(msb: i64, lsb: i64) -> uuid::Uuid {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&(msb as u64).to_be_bytes());
    bytes[8..16].copy_from_slice(&(lsb as u64).to_be_bytes());
    uuid::Uuid::from_bytes(bytes)
}

pub fn pack_flip_v2(flip: &FlipRow) -> Result<[u8; FLIP_V2_SIZE]> {
    let uuid = uuid::Uuid::parse_str(&flip.flip_uuid)?;
    let (msb, lsb) = uuid_to_signed_halves(&uuid);
    let mut buf = [0u8; FLIP_V2_SIZE];
    let mut pos = 0;
    macro_rules! put_i64 {
        ($v:expr) => {{
            buf[pos..pos + 8].copy_from_slice(&($v as i64).to_be_bytes());
            pos += 8;
        }};
    }
    macro_rules! put_i32 {
        ($v:expr) => {{
            buf[pos..pos + 4].copy_from_slice(&($v as i32).to_be_bytes());
            pos += 4;
        }};
    }

    put_i64!(msb);
    put_i64!(lsb);
    put_i32!(flip.account_id);
    put_i32!(flip.item_id);
    put_i32!(flip.opened_time);
    put_i32!(flip.opened_qty);
    put_i64!(flip.spent);
    put_i32!(flip.closed_time.unwrap_or(0));
    put_i32!(flip.closed_qty);
    put_i64!(flip.received_post_tax);
    put_i64!(flip.profit);
    put_i64!(flip.tax_paid);
    put_i32!(flip.status);
    put_i32!(flip.updated_time);
    put_i32!(if flip.deleted { 1 } else { 0 });

    debug_assert_eq!(pos, FLIP_V2_SIZE);
    Ok(buf)
}

pub struct AckedTransaction {
    pub tx_uuid: uuid::Uuid,
    pub flip_uuid: uuid::Uuid,
    pub account_id: i64,
    pub time: i64,
    pub item_id: i64,
    pub quantity: i64,
    pub price: i64,
    pub amount_spent: i64,
}

pub fn pack_acked_transaction(t: &AckedTransaction) -> [u8; ACKED_TRANSACTION_SIZE] {
    let (tx_msb, tx_lsb) = uuid_to_signed_halves(&t.tx_uuid);
    let (flip_msb, flip_lsb) = uuid_to_signed_halves(&t.flip_uuid);
    let mut buf = [0u8; ACKED_TRANSACTION_SIZE];
    let mut pos = 0;
    macro_rules! put_i64 {
        ($v:expr) => {{
            buf[pos..pos + 8].copy_from_slice(&($v as i64).to_be_bytes());
            pos += 8;
        }};
    }
    macro_rules! put_i32 {
        ($v:expr) => {{
            buf[pos..pos + 4].copy_from_slice(&($v as i32).to_be_bytes());
            pos += 4;
        }};
    }

    put_i64!(tx_msb);
    put_i64!(tx_lsb);
    put_i64!(flip_msb);
    put_i64!(flip_lsb);
    put_i32!(t.account_id);
    put_i32!(t.time);
    put_i32!(t.item_id);
    put_i32!(t.quantity);
    put_i32!(t.price);
    put_i32!(t.amount_spent);

    debug_assert_eq!(pos, ACKED_TRANSACTION_SIZE);
    buf
}

pub fn unpack_acked_transaction(buf: &[u8]) -> Result<AckedTransaction> {
    if buf.len() != ACKED_TRANSACTION_SIZE {
        bail!("acked transaction record must be {ACKED_TRANSACTION_SIZE} bytes, got {}", buf.len());
    }
    let mut pos = 0;
    macro_rules! take_i64 {
        () => {{
            let v = i64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            v
        }};
    }
    macro_rules! take_i32 {
        () => {{
            let v = i32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as i64;
            pos += 4;
            v
        }};
    }

    let tx_msb = take_i64!();
    let tx_lsb = take_i64!();
    let flip_msb = take_i64!();
    let flip_lsb = take_i64!();
    let account_id = take_i32!();
    let time = take_i32!();
    let item_id = take_i32!();
    let quantity = take_i32!();
    let price = take_i32!();
    let amount_spent = take_i32!();

    Ok(AckedTransaction {
        tx_uuid: signed_halves_to_uuid(tx_msb, tx_lsb),
        flip_uuid: signed_halves_to_uuid(flip_msb, flip_lsb),
        account_id,
        time,
        item_id,
        quantity,
        price,
        amount_spent,
    })
}

/// Prefixes a sequence of fixed-size records with a big-endian `i32` count.
pub fn pack_record_list(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + records.iter().map(|r| r.len()).sum::<usize>());
    out.extend_from_slice(&(records.len() as i32).to_be_bytes());
    for r in records {
        out.extend_from_slice(r);
    }
    out
}

pub fn encode_action_msgpack(action: &Action) -> Result<Vec<u8>> {
    let wire = ActionWire::from(action);
    Ok(rmp_serde::to_vec_named(&wire)?)
}

pub fn encode_item_price_msgpack(wire: &ItemPriceWire) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(wire)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_halves_round_trip_high_bit_set() {
        let uuid = uuid::Uuid::parse_str("ffffffff-ffff-ffff-ffff-ffffffffffff").unwrap();
        let (msb, lsb) = uuid_to_signed_halves(&uuid);
        assert_eq!(msb, -1);
        assert_eq!(lsb, -1);
        let back = signed_halves_to_uuid(msb, lsb);
        assert_eq!(back, uuid);
    }

    #[test]
    fn uuid_halves_round_trip_nil() {
        let uuid = uuid::Uuid::nil();
        let (msb, lsb) = uuid_to_signed_halves(&uuid);
        assert_eq!((msb, lsb), (0, 0));
        assert_eq!(signed_halves_to_uuid(msb, lsb), uuid);
    }

    #[test]
    fn flip_v2_packs_to_expected_size() {
        let flip = FlipRow {
            flip_uuid: uuid::Uuid::new_v4().to_string(),
            display_name: "alice".into(),
            account_id: 123,
            item_id: 7,
            opened_time: 1000,
            opened_qty: 5,
            spent: 500,
            closed_time: Some(1010),
            closed_qty: 5,
            received_post_tax: 540,
            profit: 40,
            tax_paid: 10,
            status: 2,
            updated_time: 1010,
            deleted: false,
        };
        let packed = pack_flip_v2(&flip).unwrap();
        assert_eq!(packed.len(), FLIP_V2_SIZE);
    }

    #[test]
    fn acked_transaction_round_trips() {
        let t = AckedTransaction {
            tx_uuid: uuid::Uuid::new_v4(),
            flip_uuid: uuid::Uuid::new_v4(),
            account_id: 42,
            time: 1000,
            item_id: 7,
            quantity: -5,
            price: 110,
            amount_spent: 550,
        };
        let packed = pack_acked_transaction(&t);
        let back = unpack_acked_transaction(&packed).unwrap();
        assert_eq!(back.tx_uuid, t.tx_uuid);
        assert_eq!(back.flip_uuid, t.flip_uuid);
        assert_eq!(back.account_id, t.account_id);
        assert_eq!(back.quantity, t.quantity);
        assert_eq!(back.price, t.price);
    }

    #[test]
    fn record_list_prefixes_count() {
        let records = vec![vec![1u8; ACKED_TRANSACTION_SIZE], vec![2u8; ACKED_TRANSACTION_SIZE]];
        let packed = pack_record_list(&records);
        assert_eq!(packed.len(), 4 + 2 * ACKED_TRANSACTION_SIZE);
        assert_eq!(i32::from_be_bytes(packed[0..4].try_into().unwrap()), 2);
    }
}
