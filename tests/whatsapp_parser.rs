#[path = "../src/whatsapp.rs"]
mod whatsapp;

use whatsapp::parse_wa_text;

const FORWARDED: &str = "\
*STUDENT DETAILS FOR GLB-B07 BATCH*
==============================
Full Name : fatima   ZAHRA
Mobile# : +1 (469) 555-0182
WhatsApp# : +1 469 555 0182
Gender : female
——————————————
*HOMETOWN DETAILS:*
Town/City : secunderabad
District : medchal malkajgiri
State : ts
Country : india
——————————————
*CURRENT RESIDENCE*
City : plano
State : tx
Country : usa
Pin/Zip :  75024 
——————————————
*OTHER DETAILS*
Year of birth : 1994 (approx)
Qualification : mba
Profession : Product Manager
Email Address : Fatima.Zahra@Example.COM
——————————————
*REFERRED By*
Full Name : yusuf khan
Mobile# : 91-98480-22338
Student ID# : 1432
Batch# : glb-b02
——————————————
Jazakallah khair, please confirm once registered
City : ignored after the closing marker
";

#[test]
fn forwarded_registration_message_is_fully_extracted() {
    let p = parse_wa_text(FORWARDED);

    assert_eq!(p.batch.as_deref(), Some("GLB-B07"));
    assert_eq!(p.personal.name.as_deref(), Some("Fatima Zahra"));
    assert_eq!(p.personal.mobile.as_deref(), Some("14695550182"));
    assert_eq!(p.personal.whatsapp.as_deref(), Some("14695550182"));
    assert_eq!(p.personal.gender.as_deref(), Some("F"));

    assert_eq!(p.hometown.city.as_deref(), Some("Secunderabad"));
    assert_eq!(p.hometown.district.as_deref(), Some("Medchal Malkajgiri"));
    assert_eq!(p.hometown.state.as_deref(), Some("TS"));
    assert_eq!(p.hometown.country.as_deref(), Some("India"));

    assert_eq!(p.residence.city.as_deref(), Some("Plano"));
    assert_eq!(p.residence.state.as_deref(), Some("TX"));
    assert_eq!(p.residence.country.as_deref(), Some("USA"));
    assert_eq!(p.residence.zip.as_deref(), Some("75024"));

    assert_eq!(p.other.year_of_birth, Some(1994));
    assert_eq!(p.other.education.as_deref(), Some("MBA"));
    assert_eq!(p.other.profession.as_deref(), Some("Product Manager"));
    assert_eq!(p.other.email.as_deref(), Some("fatima.zahra@example.com"));

    assert_eq!(p.referrer.name.as_deref(), Some("Yusuf Khan"));
    assert_eq!(p.referrer.mobile.as_deref(), Some("919848022338"));
    assert_eq!(p.referrer.student_id, Some(1432));
    assert_eq!(p.referrer.batch.as_deref(), Some("GLB-B02"));

    assert!(p.missing_fields().is_empty(), "{:?}", p.missing_fields());
}

#[test]
fn prefill_serializes_with_camel_case_and_nulls() {
    let p = parse_wa_text("Full Name : omar\nGender : prefer not to say");
    let v = serde_json::to_value(&p).expect("serialize");
    assert_eq!(v["personal"]["name"], "Omar");
    assert!(v["personal"]["gender"].is_null());
    assert!(v["batch"].is_null());
    assert!(v["other"]["yearOfBirth"].is_null());
    assert!(v["referrer"]["studentId"].is_null());

    let missing = p.missing_fields();
    assert!(missing.contains(&"personal.gender"));
    assert!(missing.contains(&"other.email"));
    assert!(!missing.contains(&"personal.name"));
}

#[test]
fn labels_only_match_inside_their_own_section() {
    let text = "\
STUDENT DETAILS FOR AMP-B01 BATCH
Full Name : ali
------
OTHER DETAILS
Email Address : ali@example.org
Town/City : not a hometown line
";
    let p = parse_wa_text(text);
    assert_eq!(p.batch.as_deref(), Some("AMP-B01"));
    assert_eq!(p.other.email.as_deref(), Some("ali@example.org"));
    assert_eq!(p.hometown.city, None);
}
