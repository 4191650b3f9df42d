#![no_main]
use arbitrary::Arbitrary;
use fusenfs::mask_credentials;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Query<'a> {
    base: &'a str,
    params: Vec<(&'a str, &'a str)>,
}

fuzz_target!(|query: Query| {
    let mut conn = query.base.replace('?', "");
    for (i, (key, value)) in query.params.iter().enumerate() {
        conn.push(if i == 0 { '?' } else { '&' });
        conn.push_str(key);
        conn.push('=');
        conn.push_str(value);
    }

    let masked = mask_credentials(&conn);
    assert_eq!(mask_credentials(&masked), masked);
    if !conn.contains('?') {
        assert_eq!(masked, conn);
    }
});
