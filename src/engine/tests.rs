use super::*;
use chrono::{NaiveTime, Weekday};
use crate::limits::*;

// ── Helpers ──────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("agenda_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// A Monday far enough ahead that "now" never interferes.
fn monday() -> NaiveDate {
    date(2030, 1, 7)
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn at(d: NaiveDate, h: u32, m: u32) -> Ms {
    wall_ms(d, hm(h, m))
}

fn new_engine(name: &str) -> Engine {
    Engine::new("test", test_wal_path(name), 30).unwrap()
}

async fn add_offering(engine: &Engine, minutes: u32, price_cents: Cents) -> Ulid {
    let id = Ulid::new();
    engine
        .save_offering(Offering {
            id,
            name: format!("{minutes}-minute service"),
            minutes,
            price_cents,
        })
        .await
        .unwrap();
    id
}

async fn add_professional(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .save_professional(Professional {
            id,
            name: name.into(),
            login: None,
            show_in_agenda: true,
            excluded_offering_ids: vec![],
        })
        .await
        .unwrap();
    id
}

fn request(start: Ms, offering_ids: Vec<Ulid>, professional_id: Option<Ulid>) -> NewAppointment {
    NewAppointment {
        id: Ulid::new(),
        professional_id,
        client_name: "Maria".into(),
        phone: Some("+55 11 99999-0000".into()),
        start,
        lines: vec![LineItem::new(offering_ids)],
    }
}

fn labels(slots: &[Slot]) -> Vec<&str> {
    slots.iter().map(|s| s.label.as_str()).collect()
}

// ── Seeding & configuration ──────────────────────────────

#[tokio::test]
async fn new_tenant_is_seeded_with_default_week() {
    let engine = new_engine("seeded.wal");

    let week = engine.weekly_hours(None).await;
    assert_eq!(week.len(), 7);
    assert_eq!(week[0].hours.weekday, Weekday::Mon);
    assert_eq!(week[0].hours.start, hm(8, 0));
    assert_eq!(week[0].hours.end, hm(18, 0));
    assert!(week.iter().take(6).all(|w| !w.hours.day_off));
    assert!(week[6].hours.day_off);

    let lunch = engine.lunch_break().await;
    assert!(!lunch.active);
    assert_eq!((lunch.start, lunch.end), (hm(12, 0), hm(13, 0)));

    let info = engine.tenant_info().await;
    assert_eq!(info.slug, "test");
    assert_eq!(info.settings.slot_minutes, 30);
    assert_eq!(info.settings.lead_minutes, 0);
}

#[tokio::test]
async fn settings_validate_slot_granularity() {
    let engine = new_engine("settings_granularity.wal");
    assert!(matches!(
        engine.update_settings(None, 7, 0).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.update_settings(None, 90, 0).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.update_settings(None, 15, MAX_LEAD_MINUTES + 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let settings = engine.update_settings(Some("Pet Feliz".into()), 15, 60).await.unwrap();
    assert_eq!(settings.slot_minutes, 15);
    assert_eq!(engine.tenant_info().await.settings.display_name.as_deref(), Some("Pet Feliz"));
}

#[tokio::test]
async fn weekly_hours_reject_inverted_times() {
    let engine = new_engine("weekly_inverted.wal");
    let result = engine
        .set_weekly_hours(
            None,
            WeeklyHours { weekday: Weekday::Mon, start: hm(18, 0), end: hm(8, 0), day_off: false },
        )
        .await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));

    // A day off doesn't need a valid window.
    engine
        .set_weekly_hours(
            None,
            WeeklyHours { weekday: Weekday::Mon, start: hm(18, 0), end: hm(8, 0), day_off: true },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn weekly_hours_for_unknown_professional() {
    let engine = new_engine("weekly_unknown_pro.wal");
    let ghost = Ulid::new();
    let result = engine
        .set_weekly_hours(
            Some(ghost),
            WeeklyHours { weekday: Weekday::Mon, start: hm(8, 0), end: hm(12, 0), day_off: false },
        )
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(id)) if id == ghost));
}

#[tokio::test]
async fn special_day_upsert_replaces_by_date() {
    let engine = new_engine("special_upsert.wal");
    let d = monday();
    let first = Ulid::new();
    let second = Ulid::new();
    engine
        .upsert_special_day(SpecialDay { id: first, date: d, day_off: true, start: None, end: None })
        .await
        .unwrap();
    engine
        .upsert_special_day(SpecialDay {
            id: second,
            date: d,
            day_off: false,
            start: Some(hm(9, 0)),
            end: Some(hm(12, 0)),
        })
        .await
        .unwrap();

    let days = engine.special_days().await;
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].id, second);
    assert!(!days[0].day_off);

    assert!(matches!(engine.remove_special_day(first).await, Err(EngineError::NotFound(_))));
    engine.remove_special_day(second).await.unwrap();
    assert!(engine.special_days().await.is_empty());
}

#[tokio::test]
async fn special_day_id_cannot_move_to_another_date() {
    let engine = new_engine("special_id_reuse.wal");
    let id = Ulid::new();
    let off = |date| SpecialDay { id, date, day_off: true, start: None, end: None };
    engine.upsert_special_day(off(monday())).await.unwrap();

    let tuesday = date(2030, 1, 8);
    assert!(matches!(
        engine.upsert_special_day(off(tuesday)).await,
        Err(EngineError::AlreadyExists(dup)) if dup == id
    ));
    // Re-saving on its own date is still an update.
    engine.upsert_special_day(off(monday())).await.unwrap();

    engine.remove_special_day(id).await.unwrap();
    assert!(engine.special_days().await.is_empty());
}

#[tokio::test]
async fn special_day_needs_hours_unless_off() {
    let engine = new_engine("special_needs_hours.wal");
    let result = engine
        .upsert_special_day(SpecialDay {
            id: Ulid::new(),
            date: monday(),
            day_off: false,
            start: Some(hm(9, 0)),
            end: None,
        })
        .await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn offering_validation() {
    let engine = new_engine("offering_validation.wal");
    let bad_minutes = Offering { id: Ulid::new(), name: "Bath".into(), minutes: 0, price_cents: 100 };
    assert!(matches!(engine.save_offering(bad_minutes).await, Err(EngineError::InvalidArgument(_))));

    let bad_price = Offering { id: Ulid::new(), name: "Bath".into(), minutes: 30, price_cents: -1 };
    assert!(matches!(engine.save_offering(bad_price).await, Err(EngineError::InvalidArgument(_))));

    let unnamed = Offering { id: Ulid::new(), name: "  ".into(), minutes: 30, price_cents: 0 };
    assert!(matches!(engine.save_offering(unnamed).await, Err(EngineError::InvalidArgument(_))));

    assert!(matches!(engine.remove_offering(Ulid::new()).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn offerings_filtered_by_professional_exclusions() {
    let engine = new_engine("offerings_excluded.wal");
    let bath = add_offering(&engine, 30, 4_000).await;
    let trim = add_offering(&engine, 20, 2_500).await;
    let pro = Ulid::new();
    engine
        .save_professional(Professional {
            id: pro,
            name: "Bia".into(),
            login: Some("bia".into()),
            show_in_agenda: true,
            excluded_offering_ids: vec![trim],
        })
        .await
        .unwrap();

    let all = engine.offerings(None).await.unwrap();
    assert_eq!(all.len(), 2);
    let hers = engine.offerings(Some(pro)).await.unwrap();
    assert_eq!(hers.iter().map(|o| o.id).collect::<Vec<_>>(), vec![bath]);
    assert!(matches!(engine.offerings(Some(Ulid::new())).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn professional_exclusions_must_exist() {
    let engine = new_engine("pro_exclusion_exists.wal");
    let result = engine
        .save_professional(Professional {
            id: Ulid::new(),
            name: "Bia".into(),
            login: None,
            show_in_agenda: true,
            excluded_offering_ids: vec![Ulid::new()],
        })
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn professionals_agenda_filter() {
    let engine = new_engine("pro_agenda.wal");
    add_professional(&engine, "Ana").await;
    engine
        .save_professional(Professional {
            id: Ulid::new(),
            name: "Back office".into(),
            login: None,
            show_in_agenda: false,
            excluded_offering_ids: vec![],
        })
        .await
        .unwrap();
    assert_eq!(engine.professionals(false).await.len(), 2);
    let agenda = engine.professionals(true).await;
    assert_eq!(agenda.len(), 1);
    assert_eq!(agenda[0].name, "Ana");
}

#[tokio::test]
async fn removing_professional_drops_their_hours() {
    let engine = new_engine("pro_remove_hours.wal");
    let pro = add_professional(&engine, "Ana").await;
    engine
        .set_weekly_hours(
            Some(pro),
            WeeklyHours { weekday: Weekday::Mon, start: hm(14, 0), end: hm(20, 0), day_off: false },
        )
        .await
        .unwrap();
    assert_eq!(engine.weekly_hours(Some(pro)).await.len(), 1);

    engine.remove_professional(pro).await.unwrap();
    assert!(engine.weekly_hours(Some(pro)).await.is_empty());
    assert!(matches!(engine.remove_professional(pro).await, Err(EngineError::NotFound(_))));
}

// ── Slot generation ──────────────────────────────────────

#[tokio::test]
async fn slots_require_offerings() {
    let engine = new_engine("slots_no_offerings.wal");
    let result = engine.available_slots(monday(), &[LineItem::new(vec![Ulid::new()])], None).await;
    assert!(matches!(result, Err(EngineError::ConfigurationMissing)));
}

#[tokio::test]
async fn slots_full_empty_day() {
    let engine = new_engine("slots_full_day.wal");
    let s = add_offering(&engine, 30, 0).await;

    let slots = engine.available_slots(monday(), &[LineItem::new(vec![s])], None).await.unwrap();
    assert_eq!(slots.len(), 20);
    assert_eq!(slots[0].label, "08:00");
    assert_eq!(slots[0].start, at(monday(), 8, 0));
    assert_eq!(slots.last().unwrap().label, "17:30");
}

#[tokio::test]
async fn slots_closed_day_is_empty_not_error() {
    let engine = new_engine("slots_sunday.wal");
    let s = add_offering(&engine, 30, 0).await;
    let sunday = date(2030, 1, 6);
    let slots = engine.available_slots(sunday, &[LineItem::new(vec![s])], None).await.unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn slots_zero_duration_rejected() {
    let engine = new_engine("slots_zero.wal");
    add_offering(&engine, 30, 0).await;
    let result = engine.available_slots(monday(), &[LineItem::new(vec![])], None).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn slots_skip_booked_interval() {
    let engine = new_engine("slots_skip_booked.wal");
    engine.update_settings(None, 15, 0).await.unwrap();
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();
    engine.commit_booking(request(at(d, 10, 0), vec![s], None)).await.unwrap();

    let slots = engine.available_slots(d, &[LineItem::new(vec![s])], None).await.unwrap();
    let l = labels(&slots);
    assert!(l.contains(&"09:30"));
    assert!(!l.contains(&"09:45"));
    assert!(!l.contains(&"10:00"));
    assert!(!l.contains(&"10:15"));
    assert!(l.contains(&"10:30"));
}

#[tokio::test]
async fn slots_skip_lunch() {
    let engine = new_engine("slots_lunch.wal");
    let s = add_offering(&engine, 60, 0).await;
    engine
        .set_lunch_break(LunchBreak { active: true, start: hm(12, 0), end: hm(13, 0) })
        .await
        .unwrap();

    let slots = engine.available_slots(monday(), &[LineItem::new(vec![s])], None).await.unwrap();
    let l = labels(&slots);
    assert!(l.contains(&"11:00"));
    assert!(!l.contains(&"11:30"));
    assert!(!l.contains(&"12:00"));
    assert!(!l.contains(&"12:30"));
    assert!(l.contains(&"13:00"));
}

#[tokio::test]
async fn slots_respect_special_day() {
    let engine = new_engine("slots_special_day.wal");
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();
    engine
        .upsert_special_day(SpecialDay { id: Ulid::new(), date: d, day_off: true, start: None, end: None })
        .await
        .unwrap();
    assert!(engine.available_slots(d, &[LineItem::new(vec![s])], None).await.unwrap().is_empty());

    // Open a Sunday with custom hours.
    let sunday = date(2030, 1, 13);
    engine
        .upsert_special_day(SpecialDay {
            id: Ulid::new(),
            date: sunday,
            day_off: false,
            start: Some(hm(9, 0)),
            end: Some(hm(11, 0)),
        })
        .await
        .unwrap();
    let slots = engine.available_slots(sunday, &[LineItem::new(vec![s])], None).await.unwrap();
    assert_eq!(labels(&slots), vec!["09:00", "09:30", "10:00", "10:30"]);
}

#[tokio::test]
async fn slots_multi_pet_duration() {
    let engine = new_engine("slots_multi_pet.wal");
    let bath = add_offering(&engine, 60, 5_000).await;
    let lines = vec![
        LineItem::new(vec![bath]).for_pet(PetInfo { name: "Rex".into(), breed: None }),
        LineItem::new(vec![bath]).for_pet(PetInfo { name: "Mia".into(), breed: None }),
        LineItem::new(vec![bath]).with_quantity(2),
    ];
    // 4 hours of work in a 10-hour day on a 30-minute grid.
    let slots = engine.available_slots(monday(), &lines, None).await.unwrap();
    assert_eq!(slots.last().unwrap().label, "14:00");
    assert_eq!(slots.len(), 13);
}

#[tokio::test]
async fn slots_honor_lead_time() {
    let engine = new_engine("slots_lead.wal");
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();

    let slots = engine
        .available_slots_at(d, &[LineItem::new(vec![s])], None, at(d, 12, 10))
        .await
        .unwrap();
    assert_eq!(slots[0].label, "12:30");

    engine.update_settings(None, 30, 60).await.unwrap();
    let slots = engine
        .available_slots_at(d, &[LineItem::new(vec![s])], None, at(d, 9, 0))
        .await
        .unwrap();
    assert_eq!(slots[0].label, "10:00");
}

#[tokio::test]
async fn slots_follow_professional_hours_with_fallback() {
    let engine = new_engine("slots_pro_hours.wal");
    let s = add_offering(&engine, 30, 0).await;
    let pro = add_professional(&engine, "Ana").await;
    engine
        .set_weekly_hours(
            Some(pro),
            WeeklyHours { weekday: Weekday::Tue, start: hm(14, 0), end: hm(16, 0), day_off: false },
        )
        .await
        .unwrap();

    let mon = engine.available_slots(monday(), &[LineItem::new(vec![s])], Some(pro)).await.unwrap();
    assert_eq!(mon.len(), 20);

    let tue = engine
        .available_slots(date(2030, 1, 8), &[LineItem::new(vec![s])], Some(pro))
        .await
        .unwrap();
    assert_eq!(labels(&tue), vec!["14:00", "14:30", "15:00", "15:30"]);
}

#[tokio::test]
async fn professional_scoped_blocking() {
    let engine = new_engine("slots_pro_scope.wal");
    let s = add_offering(&engine, 60, 0).await;
    let ana = add_professional(&engine, "Ana").await;
    let bia = add_professional(&engine, "Bia").await;
    let d = monday();

    engine.commit_booking(request(at(d, 9, 0), vec![s], Some(ana))).await.unwrap();

    let for_bia = engine.available_slots(d, &[LineItem::new(vec![s])], Some(bia)).await.unwrap();
    assert!(labels(&for_bia).contains(&"09:00"));

    let for_ana = engine.available_slots(d, &[LineItem::new(vec![s])], Some(ana)).await.unwrap();
    assert!(!labels(&for_ana).contains(&"09:00"));

    // Without a professional every appointment blocks.
    let unassigned = engine.available_slots(d, &[LineItem::new(vec![s])], None).await.unwrap();
    assert!(!labels(&unassigned).contains(&"09:00"));
}

#[tokio::test]
async fn no_slot_overlaps_an_active_appointment() {
    let engine = new_engine("slots_never_overlap.wal");
    engine.update_settings(None, 5, 0).await.unwrap();
    let short = add_offering(&engine, 25, 0).await;
    let long = add_offering(&engine, 50, 0).await;
    let d = monday();
    for (h, m) in [(8, 10), (9, 40), (11, 5), (15, 30)] {
        engine.commit_booking(request(at(d, h, m), vec![short], None)).await.unwrap();
    }

    let existing: Vec<Span> = engine.appointments(d, None).await.iter().map(Appointment::span).collect();
    let slots = engine.available_slots(d, &[LineItem::new(vec![long])], None).await.unwrap();
    assert!(!slots.is_empty());
    for slot in slots {
        let candidate = Span::from_minutes(slot.start, 50);
        assert!(existing.iter().all(|e| !e.overlaps(&candidate)), "{} overlaps", slot.label);
    }
}

// ── Commit validation ────────────────────────────────────

#[tokio::test]
async fn commit_snapshots_lines_and_derives_minutes() {
    let engine = new_engine("commit_snapshot.wal");
    let bath = add_offering(&engine, 30, 4_000).await;
    let trim = add_offering(&engine, 20, 2_500).await;
    let d = monday();

    let mut req = request(at(d, 9, 0), vec![], None);
    req.lines = vec![LineItem::new(vec![bath, trim]).with_quantity(2)];
    let appt = engine.commit_booking(req).await.unwrap();
    assert_eq!(appt.minutes, 100);
    assert_eq!(appt.price_cents(), 13_000);
    assert_eq!(appt.status, AppointmentStatus::Active);

    // Later price changes don't touch the booked snapshot.
    engine
        .save_offering(Offering { id: bath, name: "Bath".into(), minutes: 45, price_cents: 9_000 })
        .await
        .unwrap();
    let stored = engine.get_appointment(&appt.id).await.unwrap();
    assert_eq!(stored.minutes, 100);
    assert_eq!(stored.price_cents(), 13_000);
}

#[tokio::test]
async fn commit_conflict_names_existing() {
    let engine = new_engine("commit_conflict.wal");
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();
    let first = engine.commit_booking(request(at(d, 10, 0), vec![s], None)).await.unwrap();

    match engine.commit_booking(request(at(d, 10, 15), vec![s], None)).await {
        Err(EngineError::SlotConflict { conflicting }) => assert_eq!(conflicting, first.id),
        other => panic!("expected SlotConflict, got {other:?}"),
    }
    assert_eq!(engine.appointments(d, None).await.len(), 1);
}

#[tokio::test]
async fn commit_adjacent_is_fine() {
    let engine = new_engine("commit_adjacent.wal");
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();
    engine.commit_booking(request(at(d, 10, 0), vec![s], None)).await.unwrap();
    engine.commit_booking(request(at(d, 10, 30), vec![s], None)).await.unwrap();
    engine.commit_booking(request(at(d, 9, 30), vec![s], None)).await.unwrap();
    let starts: Vec<_> = engine.appointments(d, None).await.iter().map(|a| time_label(a.start)).collect();
    assert_eq!(starts, vec!["09:30", "10:00", "10:30"]);
}

#[tokio::test]
async fn commit_scope_rules() {
    let engine = new_engine("commit_scope.wal");
    let s = add_offering(&engine, 60, 0).await;
    let ana = add_professional(&engine, "Ana").await;
    let bia = add_professional(&engine, "Bia").await;
    let d = monday();

    engine.commit_booking(request(at(d, 9, 0), vec![s], Some(ana))).await.unwrap();
    engine.commit_booking(request(at(d, 9, 0), vec![s], Some(bia))).await.unwrap();
    assert!(matches!(
        engine.commit_booking(request(at(d, 9, 30), vec![s], None)).await,
        Err(EngineError::SlotConflict { .. })
    ));

    engine.commit_booking(request(at(d, 14, 0), vec![s], None)).await.unwrap();
    assert!(matches!(
        engine.commit_booking(request(at(d, 14, 0), vec![s], Some(ana))).await,
        Err(EngineError::SlotConflict { .. })
    ));
}

#[tokio::test]
async fn commit_outside_hours() {
    let engine = new_engine("commit_outside.wal");
    let s = add_offering(&engine, 60, 0).await;
    let d = monday();
    assert!(matches!(
        engine.commit_booking(request(at(d, 17, 30), vec![s], None)).await,
        Err(EngineError::OutsideOpeningHours)
    ));
    assert!(matches!(
        engine.commit_booking(request(at(d, 7, 0), vec![s], None)).await,
        Err(EngineError::OutsideOpeningHours)
    ));
    assert!(matches!(
        engine.commit_booking(request(at(date(2030, 1, 6), 10, 0), vec![s], None)).await,
        Err(EngineError::OutsideOpeningHours)
    ));

    engine
        .set_lunch_break(LunchBreak { active: true, start: hm(12, 0), end: hm(13, 0) })
        .await
        .unwrap();
    assert!(matches!(
        engine.commit_booking(request(at(d, 11, 30), vec![s], None)).await,
        Err(EngineError::OutsideOpeningHours)
    ));
}

#[tokio::test]
async fn commit_in_past() {
    let engine = new_engine("commit_past.wal");
    let s = add_offering(&engine, 30, 0).await;
    let past_monday = date(2001, 1, 8);
    assert!(matches!(
        engine.commit_booking(request(at(past_monday, 10, 0), vec![s], None)).await,
        Err(EngineError::InPast)
    ));
}

#[tokio::test]
async fn commit_rejects_bad_requests() {
    let engine = new_engine("commit_bad.wal");
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();

    assert!(matches!(
        engine.commit_booking(request(at(d, 9, 0), vec![], None)).await,
        Err(EngineError::InvalidArgument(_))
    ));

    let ghost = Ulid::new();
    assert!(matches!(
        engine.commit_booking(request(at(d, 9, 0), vec![s], Some(ghost))).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));

    let missing = Ulid::new();
    assert!(matches!(
        engine.commit_booking(request(at(d, 9, 0), vec![missing], None)).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));

    let mut unnamed = request(at(d, 9, 0), vec![s], None);
    unnamed.client_name = String::new();
    assert!(matches!(engine.commit_booking(unnamed).await, Err(EngineError::InvalidArgument(_))));

    assert!(matches!(
        engine.commit_booking(request(MIN_VALID_TIMESTAMP_MS - 1, vec![s], None)).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn commit_rejects_excluded_offering() {
    let engine = new_engine("commit_excluded.wal");
    let s = add_offering(&engine, 30, 0).await;
    let pro = Ulid::new();
    engine
        .save_professional(Professional {
            id: pro,
            name: "Ana".into(),
            login: None,
            show_in_agenda: true,
            excluded_offering_ids: vec![s],
        })
        .await
        .unwrap();
    assert!(matches!(
        engine.commit_booking(request(at(monday(), 9, 0), vec![s], Some(pro))).await,
        Err(EngineError::OfferingExcluded { offering, professional }) if offering == s && professional == pro
    ));
}

#[tokio::test]
async fn commit_duplicate_id() {
    let engine = new_engine("commit_duplicate.wal");
    let s = add_offering(&engine, 30, 0).await;
    let first = request(at(monday(), 9, 0), vec![s], None);
    let mut again = request(at(date(2030, 1, 8), 9, 0), vec![s], None);
    again.id = first.id;
    engine.commit_booking(first).await.unwrap();
    assert!(matches!(engine.commit_booking(again).await, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn racing_commits_yield_exactly_one_winner() {
    let engine = Arc::new(new_engine("commit_race.wal"));
    let s = add_offering(&engine, 30, 0).await;
    let start = at(monday(), 10, 0);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.commit_booking(request(start, vec![s], None)).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::SlotConflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.appointments(monday(), None).await.len(), 1);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn complete_then_cancel_is_rejected() {
    let engine = new_engine("lifecycle_complete_cancel.wal");
    let s = add_offering(&engine, 30, 3_000).await;
    let appt = engine.commit_booking(request(at(monday(), 9, 0), vec![s], None)).await.unwrap();

    let done = engine.complete_appointment(appt.id, None, PaymentMethod::Pix).await.unwrap();
    assert_eq!(done.appointment.status, AppointmentStatus::Completed);
    assert_eq!(done.appointment.payment_method, Some(PaymentMethod::Pix));
    assert!(done.credit.is_none());

    assert!(matches!(
        engine.cancel_appointment(appt.id).await,
        Err(EngineError::InvalidStateTransition { status: AppointmentStatus::Completed, .. })
    ));
    assert!(matches!(
        engine.complete_appointment(appt.id, None, PaymentMethod::Cash).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));

    let stored = engine.get_appointment(&appt.id).await.unwrap();
    assert_eq!(stored.status, AppointmentStatus::Completed);
    assert_eq!(stored.payment_method, Some(PaymentMethod::Pix));
}

#[tokio::test]
async fn cancel_frees_the_interval() {
    let engine = new_engine("lifecycle_cancel_frees.wal");
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();
    let appt = engine.commit_booking(request(at(d, 10, 0), vec![s], None)).await.unwrap();

    let cancelled = engine.cancel_appointment(appt.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

    let slots = engine.available_slots(d, &[LineItem::new(vec![s])], None).await.unwrap();
    assert!(labels(&slots).contains(&"10:00"));
    engine.commit_booking(request(at(d, 10, 0), vec![s], None)).await.unwrap();

    assert!(matches!(
        engine.cancel_appointment(appt.id).await,
        Err(EngineError::InvalidStateTransition { status: AppointmentStatus::Cancelled, .. })
    ));
    // The cancelled record stays on the agenda.
    assert_eq!(engine.appointments(d, None).await.len(), 2);
}

#[tokio::test]
async fn complete_with_amended_lines() {
    let engine = new_engine("lifecycle_amend.wal");
    let bath = add_offering(&engine, 30, 4_000).await;
    let trim = add_offering(&engine, 20, 2_500).await;
    let appt = engine.commit_booking(request(at(monday(), 9, 0), vec![bath], None)).await.unwrap();

    let done = engine
        .complete_appointment(appt.id, Some(vec![LineItem::new(vec![bath, trim])]), PaymentMethod::Cash)
        .await
        .unwrap();
    assert_eq!(done.appointment.minutes, 50);
    assert_eq!(done.appointment.price_cents(), 6_500);

    assert!(matches!(
        engine.complete_appointment(Ulid::new(), None, PaymentMethod::Cash).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn amended_lines_cannot_overrun_the_next_appointment() {
    let engine = new_engine("lifecycle_amend_overlap.wal");
    let short = add_offering(&engine, 30, 3_000).await;
    let long = add_offering(&engine, 120, 9_000).await;
    let d = monday();
    let first = engine.commit_booking(request(at(d, 9, 0), vec![short], None)).await.unwrap();
    let next = engine.commit_booking(request(at(d, 9, 30), vec![short], None)).await.unwrap();

    let result = engine
        .complete_appointment(first.id, Some(vec![LineItem::new(vec![long])]), PaymentMethod::Cash)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::SlotConflict { conflicting }) if conflicting == next.id
    ));

    let stored = engine.get_appointment(&first.id).await.unwrap();
    assert_eq!(stored.status, AppointmentStatus::Active);
    assert_eq!(stored.minutes, 30);

    // Once the neighbour is gone the longer service fits.
    engine.cancel_appointment(next.id).await.unwrap();
    let done = engine
        .complete_appointment(first.id, Some(vec![LineItem::new(vec![long])]), PaymentMethod::Cash)
        .await
        .unwrap();
    assert_eq!(done.appointment.minutes, 120);
}

#[tokio::test]
async fn amended_lines_ignore_other_professionals() {
    let engine = new_engine("lifecycle_amend_scope.wal");
    let short = add_offering(&engine, 30, 3_000).await;
    let long = add_offering(&engine, 90, 9_000).await;
    let ana = add_professional(&engine, "Ana").await;
    let bia = add_professional(&engine, "Bia").await;
    let d = monday();
    let mine = engine.commit_booking(request(at(d, 9, 0), vec![short], Some(ana))).await.unwrap();
    engine.commit_booking(request(at(d, 9, 30), vec![short], Some(bia))).await.unwrap();

    let done = engine
        .complete_appointment(mine.id, Some(vec![LineItem::new(vec![long])]), PaymentMethod::Pix)
        .await
        .unwrap();
    assert_eq!(done.appointment.minutes, 90);
}

#[tokio::test]
async fn complete_on_fiado_opens_credit() {
    let engine = new_engine("lifecycle_fiado.wal");
    let bath = add_offering(&engine, 30, 4_000).await;
    let appt = engine.commit_booking(request(at(monday(), 9, 0), vec![bath], None)).await.unwrap();

    let done = engine.complete_appointment(appt.id, None, PaymentMethod::Fiado).await.unwrap();
    let credit = done.credit.expect("credit opened");
    assert!(done.credit_error.is_none());
    assert_eq!(credit.original_cents, 4_000);
    assert_eq!(credit.remaining_cents, 4_000);
    assert_eq!(credit.appointment_id, Some(appt.id));
    assert_eq!(credit.client_name, "Maria");
    assert_eq!(done.appointment.credit_id, Some(credit.id));

    let stored = engine.get_appointment(&appt.id).await.unwrap();
    assert_eq!(stored.credit_id, Some(credit.id));
    assert_eq!(engine.list_credits(true).await.len(), 1);
}

#[tokio::test]
async fn credit_failure_keeps_the_completion() {
    let engine = Engine::new("test", test_wal_path("lifecycle_fiado_fails.wal"), 30)
        .unwrap()
        .with_credit_limit(0);
    let bath = add_offering(&engine, 30, 4_000).await;
    let appt = engine.commit_booking(request(at(monday(), 9, 0), vec![bath], None)).await.unwrap();

    let done = engine.complete_appointment(appt.id, None, PaymentMethod::Fiado).await.unwrap();
    assert!(done.credit.is_none());
    assert!(done.credit_error.as_deref().is_some_and(|e| e.contains("too many credits")));
    assert_eq!(done.appointment.status, AppointmentStatus::Completed);
    assert_eq!(done.appointment.credit_id, None);

    let stored = engine.get_appointment(&appt.id).await.unwrap();
    assert_eq!(stored.status, AppointmentStatus::Completed);
    assert_eq!(stored.payment_method, Some(PaymentMethod::Fiado));
    assert!(engine.list_credits(false).await.is_empty());
}

#[tokio::test]
async fn fiado_with_zero_total_opens_nothing() {
    let engine = new_engine("lifecycle_fiado_free.wal");
    let free = add_offering(&engine, 30, 0).await;
    let appt = engine.commit_booking(request(at(monday(), 9, 0), vec![free], None)).await.unwrap();
    let done = engine.complete_appointment(appt.id, None, PaymentMethod::Fiado).await.unwrap();
    assert!(done.credit.is_none());
    assert!(done.credit_error.is_none());
    assert!(engine.list_credits(false).await.is_empty());
}

#[tokio::test]
async fn racing_cancel_and_complete() {
    let engine = Arc::new(new_engine("lifecycle_race.wal"));
    let s = add_offering(&engine, 30, 0).await;
    let appt = engine.commit_booking(request(at(monday(), 9, 0), vec![s], None)).await.unwrap();

    let e1 = engine.clone();
    let e2 = engine.clone();
    let id = appt.id;
    let cancel = tokio::spawn(async move { e1.cancel_appointment(id).await.map(|_| ()) });
    let complete =
        tokio::spawn(async move { e2.complete_appointment(id, None, PaymentMethod::Cash).await.map(|_| ()) });

    let results = [cancel.await.unwrap(), complete.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::InvalidStateTransition { .. }))));
}

#[tokio::test]
async fn reschedule_within_day() {
    let engine = new_engine("reschedule_same_day.wal");
    let s = add_offering(&engine, 30, 0).await;
    let d = monday();
    let a = engine.commit_booking(request(at(d, 9, 0), vec![s], None)).await.unwrap();
    let b = engine.commit_booking(request(at(d, 11, 0), vec![s], None)).await.unwrap();

    match engine.reschedule_appointment(a.id, at(d, 11, 15)).await {
        Err(EngineError::SlotConflict { conflicting }) => assert_eq!(conflicting, b.id),
        other => panic!("expected SlotConflict, got {other:?}"),
    }

    // Overlapping its own old span is fine.
    let moved = engine.reschedule_appointment(a.id, at(d, 9, 15)).await.unwrap();
    assert_eq!(moved.start, at(d, 9, 15));

    let starts: Vec<_> = engine.appointments(d, None).await.iter().map(|a| time_label(a.start)).collect();
    assert_eq!(starts, vec!["09:15", "11:00"]);
}

#[tokio::test]
async fn reschedule_across_days() {
    let engine = new_engine("reschedule_cross_day.wal");
    let s = add_offering(&engine, 30, 0).await;
    let mon = monday();
    let tue = date(2030, 1, 8);
    let a = engine.commit_booking(request(at(tue, 9, 0), vec![s], None)).await.unwrap();

    engine.reschedule_appointment(a.id, at(mon, 16, 0)).await.unwrap();
    assert!(engine.appointments(tue, None).await.is_empty());
    assert_eq!(engine.appointments(mon, None).await.len(), 1);
    assert_eq!(engine.appointment_date(&a.id), Some(mon));

    // The old slot is free again.
    engine.commit_booking(request(at(tue, 9, 0), vec![s], None)).await.unwrap();

    assert!(matches!(
        engine.reschedule_appointment(a.id, at(date(2030, 1, 6), 10, 0)).await,
        Err(EngineError::OutsideOpeningHours)
    ));
}

#[tokio::test]
async fn reschedule_requires_active() {
    let engine = new_engine("reschedule_inactive.wal");
    let s = add_offering(&engine, 30, 0).await;
    let a = engine.commit_booking(request(at(monday(), 9, 0), vec![s], None)).await.unwrap();
    engine.cancel_appointment(a.id).await.unwrap();
    assert!(matches!(
        engine.reschedule_appointment(a.id, at(monday(), 10, 0)).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn delete_removes_any_status() {
    let engine = new_engine("delete_any.wal");
    let s = add_offering(&engine, 30, 0).await;
    let a = engine.commit_booking(request(at(monday(), 9, 0), vec![s], None)).await.unwrap();
    engine.complete_appointment(a.id, None, PaymentMethod::Cash).await.unwrap();
    engine.delete_appointment(a.id).await.unwrap();
    assert!(engine.get_appointment(&a.id).await.is_none());
    assert!(engine.appointments(monday(), None).await.is_empty());
    assert!(matches!(engine.delete_appointment(a.id).await, Err(EngineError::NotFound(_))));
}

// ── Credits ──────────────────────────────────────────────

#[tokio::test]
async fn credit_payments_keep_balance() {
    let engine = new_engine("credit_payments.wal");
    let id = Ulid::new();
    engine
        .open_credit(NewCredit {
            id,
            client_name: "João".into(),
            phone: None,
            description: Some("ração".into()),
            amount_cents: 10_000,
        })
        .await
        .unwrap();

    let after = engine.add_credit_payment(Ulid::new(), id, 3_000, Some("pix".into())).await.unwrap();
    assert_eq!(after.remaining_cents, 7_000);
    let paid: Cents = after.payments.iter().map(|p| p.amount_cents).sum();
    assert_eq!(paid + after.remaining_cents, after.original_cents);

    assert!(matches!(
        engine.add_credit_payment(Ulid::new(), id, 7_001, None).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.add_credit_payment(Ulid::new(), id, 0, None).await,
        Err(EngineError::InvalidArgument(_))
    ));

    let settled = engine.add_credit_payment(Ulid::new(), id, 7_000, None).await.unwrap();
    assert!(settled.is_paid_off());
    assert!(engine.list_credits(true).await.is_empty());
    assert_eq!(engine.list_credits(false).await.len(), 1);
}

#[tokio::test]
async fn credit_validation_and_delete() {
    let engine = new_engine("credit_delete.wal");
    let bad = NewCredit {
        id: Ulid::new(),
        client_name: "João".into(),
        phone: None,
        description: None,
        amount_cents: 0,
    };
    assert!(matches!(engine.open_credit(bad.clone()).await, Err(EngineError::InvalidArgument(_))));

    let good = NewCredit { amount_cents: 500, ..bad };
    let credit = engine.open_credit(good.clone()).await.unwrap();
    assert!(matches!(engine.open_credit(good).await, Err(EngineError::AlreadyExists(_))));
    assert!(matches!(
        engine.add_credit_payment(Ulid::new(), Ulid::new(), 100, None).await,
        Err(EngineError::NotFound(_))
    ));

    engine.delete_credit(credit.id).await.unwrap();
    assert!(engine.get_credit(&credit.id).await.is_none());
    assert!(matches!(engine.delete_credit(credit.id).await, Err(EngineError::NotFound(_))));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restores.wal");
    let d = monday();
    let tue = date(2030, 1, 8);
    let (kept, cancelled, moved, credit_id, pro) = {
        let engine = Engine::new("replay", path.clone(), 30).unwrap();
        let s = add_offering(&engine, 30, 2_000).await;
        let pro = add_professional(&engine, "Ana").await;
        engine
            .set_lunch_break(LunchBreak { active: true, start: hm(12, 0), end: hm(13, 0) })
            .await
            .unwrap();
        let kept = engine.commit_booking(request(at(d, 9, 0), vec![s], Some(pro))).await.unwrap();
        let cancelled = engine.commit_booking(request(at(d, 10, 0), vec![s], None)).await.unwrap();
        let moved = engine.commit_booking(request(at(d, 14, 0), vec![s], None)).await.unwrap();
        engine.cancel_appointment(cancelled.id).await.unwrap();
        engine.reschedule_appointment(moved.id, at(tue, 15, 0)).await.unwrap();
        let done = engine.complete_appointment(kept.id, None, PaymentMethod::Fiado).await.unwrap();
        let credit_id = done.credit.unwrap().id;
        engine.add_credit_payment(Ulid::new(), credit_id, 500, None).await.unwrap();
        (kept.id, cancelled.id, moved.id, credit_id, pro)
    };

    let engine = Engine::new("replay", path, 30).unwrap();
    assert!(engine.lunch_break().await.active);
    assert_eq!(engine.professionals(false).await[0].id, pro);

    let kept = engine.get_appointment(&kept).await.unwrap();
    assert_eq!(kept.status, AppointmentStatus::Completed);
    assert_eq!(kept.credit_id, Some(credit_id));
    assert_eq!(
        engine.get_appointment(&cancelled).await.unwrap().status,
        AppointmentStatus::Cancelled
    );
    assert_eq!(engine.appointment_date(&moved), Some(tue));
    assert_eq!(engine.get_appointment(&moved).await.unwrap().start, at(tue, 15, 0));

    let credit = engine.get_credit(&credit_id).await.unwrap();
    assert_eq!(credit.remaining_cents, 1_500);
    assert_eq!(credit.payments.len(), 1);

    // Replay must not re-seed.
    assert_eq!(engine.weekly_hours(None).await.len(), 7);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let d = monday();
    let (booked, credit_id) = {
        let engine = Engine::new("compact", path.clone(), 15).unwrap();
        let s = add_offering(&engine, 30, 1_000).await;
        let mut last = None;
        for i in 0..10u32 {
            let a = engine
                .commit_booking(request(at(d, 8 + i / 2, (i % 2) * 30), vec![s], None))
                .await
                .unwrap();
            last = Some(a.id);
        }
        for a in engine.appointments(d, None).await.iter().take(5) {
            engine.cancel_appointment(a.id).await.unwrap();
        }
        let done = engine
            .complete_appointment(last.unwrap(), None, PaymentMethod::Fiado)
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Still writable after the swap.
        engine.commit_booking(request(at(d, 16, 0), vec![s], None)).await.unwrap();
        (engine.appointments(d, None).await, done.credit.unwrap().id)
    };

    let engine = Engine::new("compact", path, 15).unwrap();
    assert_eq!(engine.appointments(d, None).await, booked);
    assert_eq!(engine.tenant_info().await.settings.slot_minutes, 15);
    assert!(engine.get_credit(&credit_id).await.is_some());
    assert_eq!(engine.weekly_hours(None).await.len(), 7);
}
