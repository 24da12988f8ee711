use criterion::{criterion_group, criterion_main, Criterion};
use ratewarden::rate_limit::{
    final_limit, LimitCheckRequest, LimitType, NewRule, RateLimitConfig, RateLimitManager, Scope,
};
use ratewarden::RequestContext;
use std::hint::black_box;

fn bench_check_limit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime for benchmark");
    let _guard = rt.enter();

    let manager = RateLimitManager::builder(RateLimitConfig {
        bucket_cleanup_interval_secs: 0,
        enable_metrics: false,
        ..RateLimitConfig::default()
    })
    .build()
    .expect("Failed to build rate limit manager");

    rt.block_on(async {
        // High limits so every iteration takes the allow path
        for (scope, limit_type) in [
            (Scope::Ip, LimitType::PerSecond),
            (Scope::Ip, LimitType::PerHour),
            (Scope::User, LimitType::Daily),
        ] {
            manager
                .create_rule(NewRule::new("bench", scope, limit_type, u32::MAX))
                .await
                .expect("Failed to create benchmark rule");
        }
    });

    let ctx = RequestContext::background();

    // Benchmark: no matching rule
    c.bench_function("check_limit_no_rules", |b| {
        let req = LimitCheckRequest::new("other", Scope::Ip, "10.0.0.1");
        b.iter(|| black_box(rt.block_on(manager.check_limit(&ctx, &req))));
    });

    // Benchmark: two window rules for one address
    c.bench_function("check_limit_ip_windows", |b| {
        let req = LimitCheckRequest::new("bench", Scope::Ip, "10.0.0.1");
        b.iter(|| black_box(rt.block_on(manager.check_limit(&ctx, &req))));
    });

    // Benchmark: calendar quota
    c.bench_function("check_limit_user_quota", |b| {
        let req = LimitCheckRequest::new("bench", Scope::User, "alice");
        b.iter(|| black_box(rt.block_on(manager.check_limit(&ctx, &req))));
    });

    c.bench_function("final_limit", |b| {
        b.iter(|| final_limit(black_box(1000), black_box(1.5), black_box(0.6)));
    });
}

criterion_group!(benches, bench_check_limit);
criterion_main!(benches);
