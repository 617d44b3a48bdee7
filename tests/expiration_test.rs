//! Integration tests for expiration policies

mod common;

use std::time::Duration;

use common::CountingExpiration;
use tidepool::{Expiration, SlotInfo, TimeExpiration};

fn info_with_age(age_millis: u64) -> SlotInfo<'static, ()> {
    SlotInfo::new(age_millis, 0, &())
}

#[test]
fn test_ttl_must_be_at_least_one_millisecond() {
    assert!(TimeExpiration::after(Duration::ZERO).is_err());
    assert!(TimeExpiration::after(Duration::from_nanos(999)).is_err());
    assert!(TimeExpiration::after(Duration::from_millis(1)).is_ok());
}

#[test]
fn test_age_below_ttl_is_not_expired() {
    let expiration = TimeExpiration::after(Duration::from_millis(2)).unwrap();
    assert!(!Expiration::<()>::has_expired(&expiration, &info_with_age(1)));
}

#[test]
fn test_age_equal_to_ttl_is_not_expired() {
    let expiration = TimeExpiration::after(Duration::from_millis(2)).unwrap();
    assert!(!Expiration::<()>::has_expired(&expiration, &info_with_age(2)));
}

#[test]
fn test_age_above_ttl_is_expired() {
    let expiration = TimeExpiration::after(Duration::from_millis(2)).unwrap();
    assert!(Expiration::<()>::has_expired(&expiration, &info_with_age(3)));
}

#[test]
fn test_slot_info_exposes_claim_count_and_object() {
    let value = 99u32;
    let info = SlotInfo::new(10, 4, &value);
    assert_eq!(info.age_millis(), 10);
    assert_eq!(info.claim_count(), 4);
    assert_eq!(*info.poolable(), 99);
}

#[test]
fn test_counting_expiration_sticks_to_its_last_reply() {
    let expiration = CountingExpiration::new(&[false, true]);
    let value = ();

    assert!(!Expiration::<()>::has_expired(&expiration, &SlotInfo::new(0, 0, &value)));
    assert!(Expiration::<()>::has_expired(&expiration, &SlotInfo::new(0, 1, &value)));
    // Past the end of the programme, the last reply repeats.
    assert!(Expiration::<()>::has_expired(&expiration, &SlotInfo::new(0, 2, &value)));
    assert_eq!(expiration.count(), 3);
}

#[test]
fn test_jittered_ttl_lands_in_the_window() {
    let lo = Duration::from_secs(8 * 60);
    let hi = Duration::from_secs(10 * 60);
    for _ in 0..16 {
        let expiration = TimeExpiration::with_jitter(lo, hi).unwrap();
        assert!(expiration.ttl() >= lo);
        assert!(expiration.ttl() <= hi);
    }
}
